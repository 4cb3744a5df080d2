// SPDX-License-Identifier: Apache-2.0

//! Script batch splitting
//!
//! Scripts for vendors with a batch separator (`GO` for SQL Server, `/` for
//! Oracle) are cut on lines consisting solely of that token. Each batch is
//! wrapped in STX/ETX sentinel lines before it goes on the wire.

/// Start-of-batch sentinel (ASCII STX)
pub const BATCH_BEGIN: char = '\u{02}';
/// End-of-batch sentinel (ASCII ETX)
pub const BATCH_END: char = '\u{03}';

/// Splits script lines into wrapped batches.
///
/// Without a separator the whole input is a single batch. Separator lines
/// are matched after trimming surrounding whitespace and never appear in the
/// output. Batches holding only whitespace are dropped.
pub fn split_batches<S: AsRef<str>>(lines: &[S], separator: Option<&str>) -> Vec<String> {
    let Some(separator) = separator else {
        let body: Vec<&str> = lines.iter().map(AsRef::as_ref).collect();
        return vec![wrap_batch(&body.join("\n"))];
    };

    let mut batches = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in lines.iter().map(AsRef::as_ref) {
        if line.trim() == separator {
            push_batch(&mut batches, &mut current);
        } else {
            current.push(line);
        }
    }
    push_batch(&mut batches, &mut current);

    batches
}

/// Splits a script held in one string.
pub fn split_script(script: &str, separator: Option<&str>) -> Vec<String> {
    let lines: Vec<&str> = script.lines().collect();
    split_batches(&lines, separator)
}

/// Wraps one batch in its begin/end sentinel lines.
pub fn wrap_batch(sql: &str) -> String {
    format!("{BATCH_BEGIN}\n{sql}\n{BATCH_END}")
}

fn push_batch(batches: &mut Vec<String>, current: &mut Vec<&str>) {
    if current.iter().any(|line| !line.trim().is_empty()) {
        batches.push(wrap_batch(&current.join("\n")));
    }
    current.clear();
}
