//! `${name}` reference resolution and parameter interpolation.
//!
//! A reference is the literal substring `${NAME}` inside a parameter string;
//! `NAME` is the longest run of letters, digits and underscores, optionally
//! followed by `.key` to read one level into a mapping-valued variable. The
//! bare mapping `{"var": "NAME"}` used as a parameter value is equivalent to
//! a sole-token `${NAME}` and yields the raw value.

use serde_json::Value;

use super::{eval_expression, VariableStore};
use crate::error::VmError;

/// A parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Variable name.
    pub name: String,
    /// Optional sub-key into a mapping-valued variable.
    pub key: Option<String>,
    /// Byte range of the whole `${...}` token in the source string.
    pub span: (usize, usize),
}

impl Reference {
    fn lookup<'a>(&self, vars: &'a VariableStore) -> Option<&'a Value> {
        let value = vars.get_opt(&self.name)?;
        match &self.key {
            None => Some(value),
            Some(key) => value.as_object().and_then(|map| map.get(key)),
        }
    }

    fn display(&self) -> String {
        match &self.key {
            None => format!("${{{}}}", self.name),
            Some(key) => format!("${{{}.{}}}", self.name, key),
        }
    }
}

/// Result of resolving one parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub warnings: Vec<String>,
}

impl Resolved {
    fn clean(value: Value) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Scan a string for `${NAME}` and `${NAME.key}` references.
pub fn find_references(text: &str) -> Vec<Reference> {
    let bytes = text.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] != b'$' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }
        let start = i;
        let mut j = i + 2;
        let name_start = j;
        while j < bytes.len() && is_name_char(bytes[j] as char) {
            j += 1;
        }
        let name_end = j;
        let mut key = None;
        if j < bytes.len() && bytes[j] == b'.' {
            let key_start = j + 1;
            let mut k = key_start;
            while k < bytes.len() && is_name_char(bytes[k] as char) {
                k += 1;
            }
            if k > key_start {
                key = Some(text[key_start..k].to_string());
                j = k;
            }
        }
        if name_end > name_start && j < bytes.len() && bytes[j] == b'}' {
            refs.push(Reference {
                name: text[name_start..name_end].to_string(),
                key,
                span: (start, j + 1),
            });
            i = j + 1;
        } else {
            i += 1;
        }
    }
    refs
}

/// Whether the string consists of exactly one reference and nothing else.
fn sole_reference(text: &str) -> Option<Reference> {
    let mut refs = find_references(text);
    if refs.len() == 1 && refs[0].span == (0, text.len()) {
        refs.pop()
    } else {
        None
    }
}

/// Stringify a value for embedding inside a larger string: plain strings
/// embed verbatim, everything else as compact JSON.
fn embed(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every reference with its stringified value. Missing references
/// substitute the empty string and record a warning.
pub fn interpolate(text: &str, vars: &VariableStore) -> (String, Vec<String>) {
    let refs = find_references(text);
    if refs.is_empty() {
        return (text.to_string(), Vec::new());
    }
    let mut out = String::with_capacity(text.len());
    let mut warnings = Vec::new();
    let mut cursor = 0;
    for reference in &refs {
        out.push_str(&text[cursor..reference.span.0]);
        match reference.lookup(vars) {
            Some(value) => out.push_str(&embed(value)),
            None => {
                warnings.push(format!(
                    "reference {} is not defined; substituted empty string",
                    reference.display()
                ));
            }
        }
        cursor = reference.span.1;
    }
    out.push_str(&text[cursor..]);
    (out, warnings)
}

/// Detect the `{"var": "NAME"}` shape.
fn var_shape(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get("var").and_then(Value::as_str)
}

/// Resolve a tool/jmp parameter value against the variable store.
///
/// Strings are interpolated (sole-token references yield the raw value);
/// the `{"var": name}` shape yields the raw value; everything else passes
/// through untouched. Missing sole-token or `var`-shape references are
/// errors; embedded ones downgrade to warnings.
pub fn resolve_parameter(value: &Value, vars: &VariableStore) -> Result<Resolved, VmError> {
    if let Some(name) = var_shape(value) {
        return Ok(Resolved::clean(vars.get(name)?.clone()));
    }
    let Value::String(text) = value else {
        return Ok(Resolved::clean(value.clone()));
    };
    if let Some(reference) = sole_reference(text) {
        return match reference.lookup(vars) {
            Some(found) => Ok(Resolved::clean(found.clone())),
            None => Err(VmError::unresolved(&reference.display())),
        };
    }
    let (resolved, warnings) = interpolate(text, vars);
    Ok(Resolved {
        value: Value::String(resolved),
        warnings,
    })
}

/// Evaluate the right-hand side of one `assign` write.
///
/// Value kinds, in order:
/// 1. non-string JSON values are stored verbatim (`{"var": name}` yields the
///    referenced value);
/// 2. strings without references and without arithmetic shape are stored
///    as-is;
/// 3. a sole-token `${NAME}` yields the raw referenced value;
/// 4. a string that substitutes into a pure arithmetic expression evaluates
///    to a number — references inside it must resolve to numbers;
/// 5. anything else interpolates to a string.
pub fn eval_assign_rhs(value: &Value, vars: &VariableStore) -> Result<Resolved, VmError> {
    if let Some(name) = var_shape(value) {
        return Ok(Resolved::clean(vars.get(name)?.clone()));
    }
    let Value::String(text) = value else {
        return Ok(Resolved::clean(value.clone()));
    };
    if let Some(reference) = sole_reference(text) {
        return match reference.lookup(vars) {
            Some(found) => Ok(Resolved::clean(found.clone())),
            None => Err(VmError::unresolved(&reference.display())),
        };
    }

    let refs = find_references(text);
    if refs.is_empty() {
        // No references: stored as-is, even when the text looks numeric.
        return Ok(Resolved::clean(value.clone()));
    }

    // Probe with every reference replaced by "1": if the shape is arithmetic,
    // all references must resolve (missing ones are hard errors, not
    // empty-string substitutions). A probe that fails to evaluate (literal
    // division by zero) still has arithmetic shape.
    let probe = substitute(text, &refs, |_| Some("1".to_string()));
    let probe_is_arithmetic = !matches!(eval_expression(&probe), Ok(None));
    if probe_is_arithmetic {
        let mut missing = None;
        let substituted = substitute(text, &refs, |reference| {
            match reference.lookup(vars) {
                Some(value) => Some(embed(value)),
                None => {
                    missing.get_or_insert_with(|| reference.display());
                    None
                }
            }
        });
        if let Some(name) = missing {
            return Err(VmError::unresolved(&name));
        }
        // Values may be non-numeric, in which case the substituted string is
        // no longer arithmetic and falls through to plain interpolation.
        if let Some(number) = eval_expression(&substituted)? {
            return Ok(Resolved::clean(number));
        }
    }

    let (resolved, warnings) = interpolate(text, vars);
    Ok(Resolved {
        value: Value::String(resolved),
        warnings,
    })
}

fn substitute<F>(text: &str, refs: &[Reference], mut lookup: F) -> String
where
    F: FnMut(&Reference) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for reference in refs {
        out.push_str(&text[cursor..reference.span.0]);
        if let Some(replacement) = lookup(reference) {
            out.push_str(&replacement);
        }
        cursor = reference.span.1;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn store() -> VariableStore {
        [
            ("a".to_string(), json!(3)),
            ("name".to_string(), json!("Ada")),
            ("info".to_string(), json!({"city": "Paris", "pop": 2_100_000})),
            ("list".to_string(), json!([1, 2, 3])),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_find_references_longest_name_run() {
        let refs = find_references("x ${abc_1} y ${b.key} ${} $ {n}");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "abc_1");
        assert_eq!(refs[1].name, "b");
        assert_eq!(refs[1].key.as_deref(), Some("key"));
    }

    #[test]
    fn test_sole_token_yields_raw_value() {
        let vars = store();
        for (rhs, expected) in [
            ("${a}", json!(3)),
            ("${info}", json!({"city": "Paris", "pop": 2_100_000})),
            ("${list}", json!([1, 2, 3])),
            ("${info.city}", json!("Paris")),
        ] {
            let resolved = eval_assign_rhs(&json!(rhs), &vars).unwrap();
            assert_eq!(resolved.value, expected, "rhs {}", rhs);
        }
    }

    #[test]
    fn test_var_shape_yields_raw_value() {
        let vars = store();
        let resolved = resolve_parameter(&json!({"var": "list"}), &vars).unwrap();
        assert_eq!(resolved.value, json!([1, 2, 3]));

        let err = resolve_parameter(&json!({"var": "missing"}), &vars).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedVariable);
    }

    #[test]
    fn test_embedded_reference_stringifies() {
        let vars = store();
        let resolved = eval_assign_rhs(&json!("hello ${name}, pop ${info.pop}"), &vars).unwrap();
        assert_eq!(resolved.value, json!("hello Ada, pop 2100000"));
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn test_missing_embedded_reference_warns_and_substitutes_empty() {
        let vars = store();
        let resolved = eval_assign_rhs(&json!("hello ${missing}!"), &vars).unwrap();
        assert_eq!(resolved.value, json!("hello !"));
        assert_eq!(resolved.warnings.len(), 1);
    }

    #[test]
    fn test_arithmetic_substitution_evaluates() {
        let vars = store();
        let resolved = eval_assign_rhs(&json!("${a} * 2 + 1"), &vars).unwrap();
        assert_eq!(resolved.value, json!(7));
    }

    #[test]
    fn test_missing_reference_in_arithmetic_is_an_error() {
        let vars = store();
        let err = eval_assign_rhs(&json!("${missing} + 1"), &vars).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedVariable);
    }

    #[test]
    fn test_non_numeric_value_in_arithmetic_shape_falls_back_to_string() {
        let vars = store();
        let resolved = eval_assign_rhs(&json!("${name} + 1"), &vars).unwrap();
        assert_eq!(resolved.value, json!("Ada + 1"));
    }

    #[test]
    fn test_division_by_zero_surfaces_as_instruction_failure() {
        let vars = store();
        let err = eval_assign_rhs(&json!("${a} / 0"), &vars).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolFailed);
    }

    #[test]
    fn test_non_string_rhs_stored_verbatim() {
        let vars = store();
        for rhs in [json!(42), json!(true), json!(null), json!([1]), json!({"k": 1})] {
            let resolved = eval_assign_rhs(&rhs, &vars).unwrap();
            assert_eq!(resolved.value, rhs);
        }
    }

    #[test]
    fn test_plain_string_without_references_stored_as_is() {
        let vars = store();
        for text in ["just text", "3 * 2", "42"] {
            let resolved = eval_assign_rhs(&json!(text), &vars).unwrap();
            assert_eq!(resolved.value, json!(text));
        }
    }
}
