// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Proc macro backing `test_with_tracing::test`.

#![forbid(unsafe_code)]

use proc_macro::TokenStream;
use quote::quote;
use syn::ItemFn;
use syn::parse_macro_input;

/// Marks a function as a test and installs a tracing subscriber before the
/// body runs.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        let attr = proc_macro2::TokenStream::from(attr);
        return syn::Error::new_spanned(attr, "`test` takes no arguments")
            .to_compile_error()
            .into();
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(sig.asyncness, "async tests are not supported")
            .to_compile_error()
            .into();
    }

    let output = &sig.output;

    quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis #sig {
            ::test_with_tracing::init();
            let body = move || #output #block;
            body()
        }
    }
    .into()
}
