//! Test attributes that install a `tracing` subscriber for the duration of each test.
//!
//! Both attributes accept an optional log filter literal, `warn` when omitted:
//!
//! ```rust,ignore
//! #[stored_requests_macros::tokio_test("stored_requests=debug")]
//! async fn test_something() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{ItemFn, LitStr, parse_macro_input};

const DEFAULT_FILTER: &str = "warn";

fn log_filter(attr: TokenStream) -> syn::Result<LitStr> {
    if attr.is_empty() {
        Ok(LitStr::new(DEFAULT_FILTER, proc_macro2::Span::call_site()))
    } else {
        syn::parse::<LitStr>(attr)
    }
}

fn expand(attr: TokenStream, item: TokenStream, runner: TokenStream2) -> TokenStream {
    let filter = match log_filter(attr) {
        Ok(filter) => filter,
        Err(err) => return err.to_compile_error().into(),
    };
    let input_fn = parse_macro_input!(item as ItemFn);
    let ItemFn { attrs, vis, sig, block } = input_fn;

    let expanded = quote! {
        #runner
        #[test_log(default_log_filter = #filter)]
        #(#attrs)*
        #vis #sig #block
    };

    TokenStream::from(expanded)
}

/// Async test on a multi-threaded tokio runtime, so spawned listeners and pollers
/// make progress while the test body awaits.
#[proc_macro_attribute]
pub fn tokio_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, quote! { #[test_log::test(tokio::test(flavor = "multi_thread"))] })
}

#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, quote! { #[test_log::test] })
}
