use std::panic::PanicInfo;

use crate::Plan;

fn panic_handler(panic_info: &PanicInfo<'_>) {
    println!("{}", panic_info);
    std::process::abort();
}

pub fn set_panic_handler() {
    std::panic::set_hook(Box::new(panic_handler));
}

/// Runs once before `main`, from the constructor emitted alongside the C API.
pub fn process_start<P: Plan>(plan: &'static P) {
    set_panic_handler();
    plan.init();
    unsafe {
        libc::atexit(process_exit);
        libc::pthread_atfork(Some(prepare::<P>), Some(release::<P>), Some(release::<P>));
    }
}

pub extern "C" fn process_exit() {
    crate::stat::report();
}

extern "C" fn prepare<P: Plan>() {
    P::get().pre_fork();
    crate::base::Base::pre_fork();
}

extern "C" fn release<P: Plan>() {
    crate::base::Base::post_fork();
    P::get().post_fork();
}
