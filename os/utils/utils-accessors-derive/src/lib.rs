//! # Accessor Derive
//!
//! `#[derive(Setters)]` for the builder-style request and descriptor types of
//! the memory manager, such as `kernel_alloc::RegionRequest` and
//! `kernel_alloc::PageAllocatorConfig`.

use proc_macro::TokenStream;
use quote::{ToTokens, format_ident, quote};
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::token::Comma;
use syn::{Attribute, Data, DeriveInput, Field, Fields, LitBool, parse_macro_input};

/// For every named field `x: T`, generates
///
/// - `const fn with_x(mut self, value: T) -> Self` for building by value,
/// - `fn set_x(&mut self, value: T) -> &mut Self` for chained updates.
///
/// Field options, given as `#[setters(...)]`:
///
/// - `skip` (or `skip = true`): generate nothing for this field.
/// - `get`: also generate `const fn x(&self) -> T`. `T` must be `Copy`.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Request<T> {
///     #[setters(get)]
///     pages: u64,
///     #[setters(skip)]
///     tag: T,
/// }
///
/// let mut req = Request { pages: 1, tag: () };
/// req.set_pages(2).set_pages(3);
/// assert_eq!(req.with_pages(8).pages(), 8);
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_setters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input).unwrap_or_else(|e| e.into_compile_error().into())
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut methods = Vec::new();
    for field in named_fields(input)? {
        methods.push(accessors(field)?);
    }

    Ok(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    }
    .into())
}

fn named_fields(input: &DeriveInput) -> syn::Result<&Punctuated<Field, Comma>> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            input.ident.span(),
            "#[derive(Setters)] only applies to structs",
        ));
    };
    match &data.fields {
        Fields::Named(named) => Ok(&named.named),
        other => Err(syn::Error::new(
            other.span(),
            "#[derive(Setters)] needs named fields",
        )),
    }
}

fn accessors(field: &Field) -> syn::Result<impl ToTokens> {
    let options = FieldOptions::parse(&field.attrs)?;
    let Some(name) = field.ident.as_ref().filter(|_| !options.skip) else {
        return Ok(quote! {});
    };

    let ty = &field.ty;
    let with = format_ident!("with_{}", name);
    let set = format_ident!("set_{}", name);
    let getter = options.get.then(|| {
        quote! {
            #[inline]
            #[must_use]
            pub const fn #name(&self) -> #ty {
                self.#name
            }
        }
    });

    Ok(quote! {
        #[inline]
        #[must_use]
        pub const fn #with(mut self, value: #ty) -> Self {
            self.#name = value;
            self
        }

        #[inline]
        pub fn #set(&mut self, value: #ty) -> &mut Self {
            self.#name = value;
            self
        }

        #getter
    })
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    get: bool,
}

impl FieldOptions {
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in attrs.iter().filter(|a| a.path().is_ident("setters")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    options.skip = if meta.input.is_empty() {
                        true
                    } else {
                        meta.value()?.parse::<LitBool>()?.value
                    };
                    Ok(())
                } else if meta.path.is_ident("get") {
                    options.get = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `skip` or `get`"))
                }
            })?;
        }
        Ok(options)
    }
}
