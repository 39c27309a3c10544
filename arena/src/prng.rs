/// Linear congruential generator. Only the high bits are usable, so draws
/// always take the top `bits` of the state.
#[derive(Clone)]
pub struct Lcg {
    state: u32,
    a: u32,
    c: u32,
}

impl Lcg {
    pub const fn new(a: u32, c: u32, seed: u32) -> Self {
        Self { state: seed, a, c }
    }

    pub fn next_bits(&mut self, bits: usize) -> u32 {
        debug_assert!(bits > 0 && bits <= 32);
        self.state = self.a.wrapping_mul(self.state).wrapping_add(self.c);
        self.state >> (32 - bits)
    }
}

/// Seed material that differs per thread.
pub fn thread_seed() -> u32 {
    let id = unsafe { libc::pthread_self() } as usize;
    // Thread ids are pointer-like; fold the high bits down.
    ((id >> 32) as u32) ^ (id as u32) ^ 0x9e37_79b9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_stay_in_range() {
        let mut prng = Lcg::new(1297, 1301, 42);
        for _ in 0..1000 {
            assert!(prng.next_bits(3) < 8);
        }
    }

    #[test]
    fn sequences_differ_by_seed() {
        let mut a = Lcg::new(12345, 12347, 1);
        let mut b = Lcg::new(12345, 12347, 2);
        let sa: Vec<u32> = (0..8).map(|_| a.next_bits(16)).collect();
        let sb: Vec<u32> = (0..8).map(|_| b.next_bits(16)).collect();
        assert_ne!(sa, sb);
    }
}
