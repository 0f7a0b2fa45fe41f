use heck::ToUpperCamelCase;
use itertools::Itertools;
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{
    FnArg, Ident, ItemFn, LitStr, Path, ReturnType, Type, meta::ParseNestedMeta, spanned::Spanned,
};

#[derive(Default)]
pub struct KernelArgs {
    crate_name: Option<Path>,
    name: Option<LitStr>,
}

impl KernelArgs {
    pub fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("crate") {
            let s: LitStr = meta.value()?.parse()?;
            self.crate_name = Some(s.parse::<Path>()?);
            Ok(())
        } else if meta.path.is_ident("name") {
            self.name = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("unexpected attribute; supported are `crate` and `name`"))
        }
    }
}

fn struct_name(ident: &Ident) -> Ident {
    let name = ident.to_string().to_upper_camel_case();
    format_ident!("{}", name, span = ident.span())
}

pub fn kernel(args: KernelArgs, input: ItemFn) -> syn::Result<TokenStream> {
    let sig = &input.sig;
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(sig.generics.span(), "kernel functions cannot be generic"));
    }
    if sig.asyncness.is_some() || sig.unsafety.is_some() {
        return Err(syn::Error::new(sig.span(), "kernel functions must be safe and synchronous"));
    }

    // argument types, in order
    let inputs = sig
        .inputs
        .iter()
        .map(|arg| match arg {
            FnArg::Typed(pat) => Ok(pat.ty.as_ref().clone()),
            FnArg::Receiver(receiver) => Err(syn::Error::new(
                receiver.span(),
                "kernel functions cannot take `self`",
            )),
        })
        .collect::<syn::Result<Vec<Type>>>()?;
    if inputs.is_empty() {
        return Err(syn::Error::new(sig.inputs.span(), "kernel functions need an argument"));
    }
    let output = match &sig.output {
        ReturnType::Type(_, ty) => ty.as_ref().clone(),
        ReturnType::Default => {
            return Err(syn::Error::new(sig.span(), "kernel functions must return a value"));
        }
    };

    let base_path = match args.crate_name {
        Some(path) => quote!(#path),
        None => quote!(::spindle),
    };
    let vis = &input.vis;
    let func = &sig.ident;
    let name = match args.name {
        Some(name) => name.value(),
        None => func.to_string(),
    };
    let struct_name = struct_name(func);

    let nargs = inputs.len() + 1;
    let last = inputs.len();
    let types = inputs
        .iter()
        .chain(std::iter::once(&output))
        .map(|ty| quote!(<#ty as #base_path::num::Element>::DATA_TYPE))
        .collect_vec();
    let loads = inputs.iter().enumerate().map(|(arg, ty)| {
        let var = format_ident!("x{}", arg);
        quote!(let #var: #ty = args.load(#arg, index);)
    });
    let vars = (0..inputs.len()).map(|arg| format_ident!("x{}", arg));
    let doc = format!("Kernel applying [`{func}`] element-wise.");

    Ok(quote! {
        #input

        #[doc = #doc]
        #[derive(Debug, Default, Clone, Copy)]
        #vis struct #struct_name;

        impl #struct_name {
            pub const TYPES: [#base_path::num::DataType; #nargs] = [#(#types),*];

            pub fn entry() -> #base_path::kernel::KernelEntry {
                #base_path::kernel::KernelEntry::new(Self::TYPES, Self)
            }
        }

        impl #base_path::kernel::Kernel for #struct_name {
            fn name(&self) -> ::std::borrow::Cow<'static, str> {
                ::std::borrow::Cow::Borrowed(#name)
            }

            unsafe fn execute(
                &self,
                args: &#base_path::kernel::KernelArgs,
            ) -> ::std::result::Result<(), #base_path::kernel::KernelError> {
                if args.ptrs.len() != #nargs {
                    return Err(#base_path::kernel::KernelError::Arity(#nargs, args.ptrs.len()));
                }
                for index in 0..args.len {
                    unsafe {
                        #(#loads)*
                        args.store(#last, index, #func(#(#vars),*));
                    }
                }
                Ok(())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use proc_macro2::Span;
    use syn::Ident;

    use super::struct_name;

    #[test]
    fn test_struct_name() {
        let name = |ident: &str| struct_name(&Ident::new(ident, Span::call_site())).to_string();
        assert_eq!(name("sqrt_f16"), "SqrtF16");
        assert_eq!(name("fused_multiply_add"), "FusedMultiplyAdd");
        assert_eq!(name("abs"), "Abs");
    }
}
