// Copyright 2025 The fabr contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `task:arg1,arg2,key=value` invocation grammar.
//!
//! Commas separate arguments and `=` separates a keyword from its value;
//! both can appear inside values escaped as `\,` and `\=`.

use std::collections::HashMap;

/// One task named on the command line, with its parsed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInvocation {
    pub name: String,
    pub args: Vec<String>,
    pub kwargs: HashMap<String, String>,
}

/// Parse `name[:arg,...,key=value,...]`.
pub fn parse_invocation(spec: &str) -> Result<TaskInvocation, String> {
    let (name, arg_str) = match spec.split_once(':') {
        Some((name, rest)) => (name, Some(rest)),
        None => (spec, None),
    };
    if name.is_empty() {
        return Err(format!("empty task name in {spec:?}"));
    }

    let mut args = Vec::new();
    let mut kwargs = HashMap::new();
    if let Some(arg_str) = arg_str {
        for part in split_unescaped(arg_str, ',') {
            match find_unescaped(&part, '=') {
                Some(idx) => {
                    let key = unescape(&part[..idx]);
                    let value = unescape(&part[idx + 1..]);
                    if key.is_empty() {
                        return Err(format!("empty keyword name in {spec:?}"));
                    }
                    kwargs.insert(key, value);
                }
                None => args.push(unescape(&part)),
            }
        }
    }

    Ok(TaskInvocation {
        name: name.to_string(),
        args,
        kwargs,
    })
}

/// Split on `sep`, leaving escape sequences intact for later passes.
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            parts.last_mut().unwrap().push('\\');
            parts.last_mut().unwrap().push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(String::new());
        } else {
            parts.last_mut().unwrap().push(c);
        }
    }
    if escaped {
        parts.last_mut().unwrap().push('\\');
    }
    parts
}

/// Index of the first `target` not preceded by a backslash.
fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(idx);
        }
    }
    None
}

/// Resolve `\,` and `\=`; other backslashes pass through.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            if !matches!(c, ',' | '=') {
                out.push('\\');
            }
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name() {
        let inv = parse_invocation("deploy").unwrap();
        assert_eq!(inv.name, "deploy");
        assert!(inv.args.is_empty());
        assert!(inv.kwargs.is_empty());
    }

    #[test]
    fn test_positional_args() {
        let inv = parse_invocation("deploy:staging,v2").unwrap();
        assert_eq!(inv.args, vec!["staging", "v2"]);
    }

    #[test]
    fn test_keyword_args() {
        let inv = parse_invocation("deploy:env=prod,branch=main").unwrap();
        assert!(inv.args.is_empty());
        assert_eq!(inv.kwargs["env"], "prod");
        assert_eq!(inv.kwargs["branch"], "main");
    }

    #[test]
    fn test_mixed_args() {
        let inv = parse_invocation("t:one,two,key=val").unwrap();
        assert_eq!(inv.args, vec!["one", "two"]);
        assert_eq!(inv.kwargs["key"], "val");
    }

    #[test]
    fn test_escaped_comma_in_value() {
        let inv = parse_invocation(r"t:msg=hello\, world").unwrap();
        assert_eq!(inv.kwargs["msg"], "hello, world");
    }

    #[test]
    fn test_escaped_equals_in_positional() {
        let inv = parse_invocation(r"t:a\=b").unwrap();
        assert_eq!(inv.args, vec!["a=b"]);
        assert!(inv.kwargs.is_empty());
    }

    #[test]
    fn test_escaped_equals_in_value() {
        let inv = parse_invocation(r"t:expr=a\=b").unwrap();
        assert_eq!(inv.kwargs["expr"], "a=b");
    }

    #[test]
    fn test_other_backslashes_pass_through() {
        let inv = parse_invocation(r"t:path=C:\temp").unwrap();
        assert_eq!(inv.kwargs["path"], r"C:\temp");
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(parse_invocation("").is_err());
        assert!(parse_invocation(":a,b").is_err());
    }

    #[test]
    fn test_empty_arg_is_kept() {
        let inv = parse_invocation("t:,x").unwrap();
        assert_eq!(inv.args, vec!["", "x"]);
    }
}
