//! Flat variable substitution for message subjects and bodies.
//! Supports `{{first_name}}`-style placeholders; unresolved variables render
//! as empty strings rather than failing the send.

use cadence_core::model::Variables;

/// Substitute `{{name}}` placeholders from `vars`.
pub fn render(template: &str, vars: &Variables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = vars.get(key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated braces pass through verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
