use proc_macro::TokenStream;
use quote::quote;

#[proc_macro_attribute]
pub fn plan(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(item as syn::DeriveInput);
    let name = &input.ident;
    let result = quote! {
        #input

        mod __allockit_plan {
            type Plan = super::#name;

            pub(super) static PLAN: ::allockit::util::Lazy<Plan> =
                ::allockit::util::Lazy::new(|| <Plan as ::allockit::Plan>::new());

            impl ::allockit::plan::Singleton for super::#name {
                fn singleton() -> &'static Self {
                    &PLAN
                }
            }

            ::allockit::export_malloc_api!(PLAN, super::super::#name);
            ::allockit::export_rust_global_alloc_api!(super::super::#name);
        }

        pub use __allockit_plan::__allockit_rust_api::Global;
    };
    result.into()
}

/// Installs the per-thread mutator behind a `#[thread_local]` static.
///
/// The static is expanded into the annotated crate, so that crate needs
/// `#![feature(thread_local)]`.
#[proc_macro_attribute]
pub fn mutator(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(item as syn::DeriveInput);
    let name = &input.ident;
    let result = quote! {
        #[repr(align(256))]
        #input

        mod __allockit_mutator {
            #[thread_local]
            pub(super) static mut MUTATOR: ::allockit::util::Lazy<
                super::#name,
                ::allockit::util::Local,
            > = ::allockit::util::Lazy::new(|| <super::#name as ::allockit::Mutator>::new());
        }

        impl ::allockit::mutator::TLS for #name {
            fn current() -> &'static mut Self {
                unsafe { &mut **::core::ptr::addr_of_mut!(__allockit_mutator::MUTATOR) }
            }
        }
    };
    result.into()
}

#[proc_macro_attribute]
pub fn interpose(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(item as syn::ItemFn);
    let result = quote! {
        #[cfg(not(test))]
        #[no_mangle]
        #input
    };
    result.into()
}
