use crate::core::model::MethodMeta;

const VOID_TYPES: &[&str] = &["void", "java.lang.void", ""];
const BOOLEAN_TYPES: &[&str] = &["boolean", "java.lang.boolean"];

/// Simple method name: the text before `(` after the last `.`
pub fn simple_name(method_fqn: &str) -> &str {
    let head = method_fqn.split('(').next().unwrap_or(method_fqn);
    head.rsplit('.').next().unwrap_or(head)
}

/// Whether a method is shaped like a getter or setter.
///
/// `get*` with no parameters and a non-void return, `is*` with no
/// parameters and a boolean return, `set*` with one parameter and a void
/// return. A method without metadata counts as having no parameters and
/// an empty (void) return type.
pub fn is_accessor(method_fqn: &str, meta: Option<&MethodMeta>) -> bool {
    let name = simple_name(method_fqn);
    let params = meta.map(|m| m.parameters.len()).unwrap_or(0);
    let ret = meta
        .map(|m| m.return_type.to_lowercase())
        .unwrap_or_default();
    let ret = ret.as_str();

    if name.starts_with("get") && params == 0 && !VOID_TYPES.contains(&ret) {
        return true;
    }
    if name.starts_with("is") && params == 0 && BOOLEAN_TYPES.contains(&ret) {
        return true;
    }
    name.starts_with("set") && params == 1 && VOID_TYPES.contains(&ret)
}

/// `name(args)` for an FQN like `pkg.Class.name(args)`; the FQN itself when
/// it has no argument list
pub fn display_name(method_fqn: &str) -> String {
    match method_fqn.split_once('(') {
        Some((head, args)) => {
            let name = head.rsplit('.').next().unwrap_or(head);
            format!("{}({}", name, args)
        }
        None => method_fqn.to_string(),
    }
}
