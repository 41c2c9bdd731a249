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

//! Interactive terminal prompts. Each exchange runs under the process-wide
//! terminal lock, so concurrent host output never interleaves with a
//! question or its answer.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use regex::Regex;

use crate::env::Env;
use crate::errors::{Error, Result};
use crate::output;

/// Validation applied to a prompted value; failures re-prompt.
#[derive(Clone)]
pub enum Validator {
    /// The input must match this pattern in full.
    Pattern(Regex),
    /// Arbitrary check; may normalize the value. `Err` carries the message
    /// shown before re-prompting.
    Func(Arc<dyn Fn(&str) -> std::result::Result<String, String> + Send + Sync>),
}

impl Validator {
    pub fn pattern(pattern: &str) -> Result<Self> {
        // Anchor bare patterns so "validate" means "the whole input".
        let anchored = if pattern.starts_with('^') || pattern.ends_with('$') {
            pattern.to_string()
        } else {
            format!("^{pattern}$")
        };
        Regex::new(&anchored)
            .map(Validator::Pattern)
            .map_err(|e| Error::Aborted(format!("bad prompt validation pattern: {e}")))
    }

    fn apply(&self, input: &str) -> std::result::Result<String, String> {
        match self {
            Validator::Pattern(re) => {
                if re.is_match(input) {
                    Ok(input.to_string())
                } else {
                    Err(format!("input did not match {:?}", re.as_str()))
                }
            }
            Validator::Func(f) => f(input),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Validator::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// Ask the user a question on the controlling terminal.
///
/// Stores the validated answer under `env[key]` when a key is given.
/// Aborts instead of blocking when `abort_on_prompts` is set or the caller
/// is a parallel worker.
pub async fn prompt_user(
    env: &mut Env,
    text: &str,
    key: Option<&str>,
    default: Option<&str>,
    validate: Option<&Validator>,
) -> Result<String> {
    if env.abort_on_prompts() || env.bool_of("parallel") {
        return Err(Error::PromptAborted(format!("input for {text:?}")));
    }

    let rendered = match default {
        Some(d) => format!("{text} [{d}] "),
        None => format!("{text} "),
    };
    let default = default.map(str::to_string);
    let validate = validate.cloned();

    // The whole ask/read/re-ask loop holds the terminal lock, so nothing
    // interleaves with the exchange; that blocks, hence the dedicated
    // thread.
    let value = tokio::task::spawn_blocking(move || {
        output::with_terminal_lock(|stderr| -> Result<String> {
            loop {
                write!(stderr, "{rendered}")?;
                stderr.flush()?;
                let mut line = String::new();
                std::io::stdin().read_line(&mut line)?;
                let raw = line.trim_end_matches(['\r', '\n']);
                let candidate = if raw.is_empty() {
                    default.clone().unwrap_or_default()
                } else {
                    raw.to_string()
                };
                match &validate {
                    None => return Ok(candidate),
                    Some(v) => match v.apply(&candidate) {
                        Ok(validated) => return Ok(validated),
                        Err(message) => {
                            writeln!(stderr, "Validation failed: {message} Please try again.")?;
                        }
                    },
                }
            }
        })
    })
    .await
    .map_err(|e| Error::Aborted(format!("prompt task failed: {e}")))??;

    if let Some(key) = key {
        env.set(key, value.clone());
    }
    Ok(value)
}

/// Read a password without echo, re-prompting on empty input. Callers are
/// responsible for the abort-on-prompts check.
pub async fn password_prompt(text: &str) -> Result<String> {
    let rendered = format!("{text}: ");
    tokio::task::spawn_blocking(move || {
        output::with_terminal_lock(|stderr| -> Result<String> {
            loop {
                write!(stderr, "{rendered}")?;
                stderr.flush()?;
                let password = rpassword::read_password()?;
                if !password.is_empty() {
                    return Ok(password);
                }
                writeln!(
                    stderr,
                    "Sorry, you can't enter an empty password. Please try again."
                )?;
            }
        })
    })
    .await
    .map_err(|e| Error::Aborted(format!("prompt task failed: {e}")))?
}
