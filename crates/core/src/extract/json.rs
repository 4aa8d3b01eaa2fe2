//! Incremental JSON helpers for streamed tool arguments.
//!
//! [`PartialJson::scan`] reads one JSON value from the start of a string
//! that may still be growing. It produces a compact rendering (whitespace
//! outside strings dropped) that only ever grows as more input arrives, so
//! it can be streamed fragment by fragment. [`PartialJson::autocomplete`]
//! closes the value as far as it can to give a parseable best guess.

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialJson {
    /// Compact text of the value scanned so far.
    pub compact: String,
    /// The top-level value is closed.
    pub complete: bool,
    /// Bytes of input that belong to the value.
    pub consumed: usize,
    closers: Vec<char>,
    in_string: bool,
    /// Start of an unfinished escape inside the current string.
    pending_escape: Option<usize>,
    /// Last prefix length at which appending the closers gives valid JSON.
    safe_point: Option<(usize, Vec<char>)>,
}

impl PartialJson {
    pub fn scan(input: &str) -> Self {
        let mut out = Self::default();
        let mut escape = false;
        let mut unicode_left = 0usize;

        for (i, ch) in input.char_indices() {
            if out.in_string {
                out.compact.push(ch);
                if unicode_left > 0 {
                    unicode_left -= 1;
                    if unicode_left == 0 {
                        out.pending_escape = None;
                    }
                } else if escape {
                    escape = false;
                    if ch == 'u' {
                        unicode_left = 4;
                    } else {
                        out.pending_escape = None;
                    }
                } else if ch == '\\' {
                    escape = true;
                    out.pending_escape = Some(out.compact.len() - 1);
                } else if ch == '"' {
                    out.in_string = false;
                    if out.closers.is_empty() {
                        out.complete = true;
                        out.consumed = i + ch.len_utf8();
                        break;
                    }
                }
                continue;
            }

            // A bare top-level scalar ends at the first delimiter.
            let top_level_scalar = out.closers.is_empty() && !out.compact.is_empty();
            if top_level_scalar && (ch.is_whitespace() || matches!(ch, ',' | '}' | ']')) {
                out.complete = true;
                out.consumed = i;
                break;
            }

            match ch {
                c if c.is_whitespace() => {}
                '"' => {
                    out.in_string = true;
                    out.compact.push(ch);
                }
                '{' | '[' => {
                    out.compact.push(ch);
                    out.closers.push(if ch == '{' { '}' } else { ']' });
                    out.mark_safe();
                }
                '}' | ']' => {
                    out.compact.push(ch);
                    out.closers.pop();
                    if out.closers.is_empty() {
                        out.complete = true;
                        out.consumed = i + 1;
                        break;
                    }
                }
                ',' => {
                    out.mark_safe();
                    out.compact.push(ch);
                }
                _ => out.compact.push(ch),
            }
        }

        if !out.complete {
            out.consumed = input.len();
        }
        out
    }

    fn mark_safe(&mut self) {
        self.safe_point = Some((self.compact.len(), self.closers.clone()));
    }

    /// Best parseable rendering of the value so far.
    ///
    /// Tries closing the value exactly where the input stops, then falls
    /// back to the last point where every open container held only complete
    /// members.
    pub fn autocomplete(&self) -> Option<String> {
        if self.compact.is_empty() {
            return None;
        }
        if self.complete {
            return Some(self.compact.clone());
        }

        let mut candidate = self.compact.clone();
        if self.in_string {
            if let Some(start) = self.pending_escape {
                candidate.truncate(start);
            }
            candidate.push('"');
        }
        candidate.extend(self.closers.iter().rev());
        if is_valid_json(&candidate) {
            return Some(candidate);
        }

        let (len, closers) = self.safe_point.as_ref()?;
        let mut fallback = self.compact[..*len].to_string();
        fallback.extend(closers.iter().rev());
        is_valid_json(&fallback).then_some(fallback)
    }

    pub fn parse_autocompleted(&self) -> Option<Value> {
        self.autocomplete()
            .and_then(|s| serde_json::from_str(&s).ok())
    }
}

fn is_valid_json(s: &str) -> bool {
    serde_json::from_str::<Value>(s).is_ok()
}

/// Parse a possibly unfinished JSON document into its best-guess value.
pub fn parse_partial(input: &str) -> Option<Value> {
    PartialJson::scan(input.trim_start()).parse_autocompleted()
}

/// Compact a complete JSON value while keeping its member order.
pub fn compact_json(input: &str) -> Option<String> {
    let scanned = PartialJson::scan(input.trim_start());
    (scanned.complete && is_valid_json(&scanned.compact)).then_some(scanned.compact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compact_drops_whitespace_outside_strings_only() {
        let scanned = PartialJson::scan(r#"{ "city" : "New  York", "n": [1, 2] } trailing"#);
        assert!(scanned.complete);
        assert_eq!(scanned.compact, r#"{"city":"New  York","n":[1,2]}"#);
        assert_eq!(&r#"{ "city" : "New  York", "n": [1, 2] } trailing"#[scanned.consumed..], " trailing");
    }

    #[test]
    fn compact_prefix_only_grows() {
        let full = r#"{"a": {"b": "x\"y"}, "c": 12.5}"#;
        let mut last = String::new();
        for end in 1..=full.len() {
            let scanned = PartialJson::scan(&full[..end]);
            assert!(scanned.compact.starts_with(&last), "at {end}");
            last = scanned.compact;
        }
        assert_eq!(last, r#"{"a":{"b":"x\"y"},"c":12.5}"#);
    }

    #[test]
    fn autocomplete_closes_open_strings_and_containers() {
        let scanned = PartialJson::scan(r#"{"city": "Par"#);
        assert_eq!(scanned.autocomplete().as_deref(), Some(r#"{"city":"Par"}"#));

        let scanned = PartialJson::scan(r#"[{"name": "f", "parameters": {"#);
        assert_eq!(
            scanned.parse_autocompleted(),
            Some(json!([{"name": "f", "parameters": {}}]))
        );
    }

    #[test]
    fn autocomplete_falls_back_to_last_complete_member() {
        let scanned = PartialJson::scan(r#"{"a":1,"b":"#);
        assert_eq!(scanned.autocomplete().as_deref(), Some(r#"{"a":1}"#));

        let scanned = PartialJson::scan(r#"{"ke"#);
        assert_eq!(scanned.autocomplete().as_deref(), Some("{}"));
    }

    #[test]
    fn autocomplete_drops_unfinished_escape() {
        let scanned = PartialJson::scan(r#"{"s": "a\"#);
        assert_eq!(scanned.autocomplete().as_deref(), Some(r#"{"s":"a"}"#));

        let scanned = PartialJson::scan(r#"{"s": "a\u00"#);
        assert_eq!(scanned.autocomplete().as_deref(), Some(r#"{"s":"a"}"#));
    }

    #[test]
    fn top_level_scalars_end_at_delimiters() {
        let scanned = PartialJson::scan("42}");
        assert!(scanned.complete);
        assert_eq!(scanned.compact, "42");
        assert_eq!(scanned.consumed, 2);

        let scanned = PartialJson::scan(r#""text" }"#);
        assert!(scanned.complete);
        assert_eq!(scanned.compact, r#""text""#);
    }

    #[test]
    fn parse_partial_and_compact_helpers() {
        assert_eq!(parse_partial(r#"  [{"name": "get_w"#), Some(json!([{"name": "get_w"}])));
        assert_eq!(parse_partial(""), None);
        assert_eq!(compact_json(r#"{"b": 1, "a": 2}"#).as_deref(), Some(r#"{"b":1,"a":2}"#));
        assert_eq!(compact_json(r#"{"b": 1"#), None);
    }
}
