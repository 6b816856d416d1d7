// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `#[test]` attribute exported by `test_with_tracing`.

use quote::quote;
use syn::Error;
use syn::ItemFn;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Like `#[test]`, but installs the `tracing` test subscriber before the
/// body runs.
///
/// Attributes on the function, such as `#[should_panic]`, apply to the
/// generated test.
#[proc_macro_attribute]
pub fn test(
    _attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    make_test(item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn make_test(mut item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if let Some(asyncness) = item.sig.asyncness {
        return Err(Error::new(asyncness.span(), "test function must not be async"));
    }
    if !item.sig.inputs.is_empty() {
        return Err(Error::new(
            item.sig.inputs.span(),
            "test function must take no arguments",
        ));
    }

    let attrs = std::mem::take(&mut item.attrs);
    let vis = &item.vis;
    let name = &item.sig.ident;
    let output = &item.sig.output;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            #item
            ::test_with_tracing::init();
            #name()
        }
    })
}
