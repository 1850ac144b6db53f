/// Normalize a user-supplied table name into a safe SQL identifier.
///
/// Rules: lowercase, non-`[a-z0-9_]` replaced with `_`,
/// leading digits prefixed with `t_`, empty input mapped to `server_log`,
/// runs of underscores collapsed and trimmed from both ends (re-checking
/// for emptiness after the trim).
pub fn normalize_table_name(raw: &str) -> String {
    if raw.is_empty() {
        return "server_log".to_string();
    }

    let lowered: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(lowered.len());
    let mut last_was_underscore = false;
    for c in lowered.chars() {
        if c == '_' {
            if !last_was_underscore {
                collapsed.push('_');
            }
            last_was_underscore = true;
        } else {
            collapsed.push(c);
            last_was_underscore = false;
        }
    }

    let trimmed = collapsed.trim_matches('_');

    let prefixed = if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("t_{trimmed}")
    } else {
        trimmed.to_string()
    };

    if prefixed.is_empty() {
        "server_log".to_string()
    } else {
        prefixed
    }
}
