use std::alloc::Layout;

use crate::options::Options;
use crate::{mutator::Mutator, util::Address};

pub trait Plan: Singleton + Sized + 'static {
    type Mutator: Mutator<Plan = Self>;

    fn new() -> Self;
    fn init(&'static self) {}
    fn get_layout(ptr: Address) -> Layout;

    fn options(&self) -> &Options {
        static DEFAULT: Options = Options::DEFAULT;
        &DEFAULT
    }

    /// Acquire every lock the plan owns, in the plan's canonical order.
    fn pre_fork(&self) {}
    /// Release every lock acquired by [`Plan::pre_fork`], in reverse order.
    fn post_fork(&self) {}

    fn get() -> &'static Self {
        <Self as Singleton>::singleton()
    }
}

pub trait Singleton: Sized + 'static {
    fn singleton() -> &'static Self;
}
