use proc_macro::TokenStream;
use syn::{ItemFn, parse_macro_input};

mod kernel;

/// Turns a scalar function into a kernel type.
///
/// ```ignore
/// #[kernel(name = "sqrt")]
/// fn sqrt_f64(x: f64) -> f64 {
///     x.sqrt()
/// }
///
/// let entry = SqrtF64::entry();
/// ```
///
/// The function is kept as is. Next to it, a unit struct named after the function in
/// `PascalCase` implements `Kernel` by applying the function to every element, with
/// `TYPES` listing the argument types followed by the return type.
#[proc_macro_attribute]
pub fn kernel(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = kernel::KernelArgs::default();
    let parser = syn::meta::parser(|meta| args.parse(meta));
    parse_macro_input!(attr with parser);

    let input = parse_macro_input!(item as ItemFn);
    let expanded = match kernel::kernel(args, input) {
        Ok(expanded) => expanded,
        Err(err) => err.to_compile_error(),
    };
    expanded.into()
}
