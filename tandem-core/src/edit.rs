//! Range edits exchanged with the editor widget.
//!
//! Indices count Unicode scalar values (`char`s), not bytes.

use serde::{Deserialize, Serialize};

/// One visible change to the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEdit {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

impl TextEdit {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        TextEdit::Insert { index, text: text.into() }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        TextEdit::Delete { index, len }
    }

    /// Apply to a plain string mirror of the document.
    ///
    /// Out-of-range edits are clamped to the end of `target`.
    pub fn apply_to(&self, target: &mut String) {
        match self {
            TextEdit::Insert { index, text } => {
                let at = byte_offset(target, *index);
                target.insert_str(at, text);
            }
            TextEdit::Delete { index, len } => {
                let start = byte_offset(target, *index);
                let end = byte_offset(target, index + len);
                target.replace_range(start..end, "");
            }
        }
    }
}

fn byte_offset(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Merge adjacent edits produced one character at a time.
///
/// `Insert{i,"a"}, Insert{i+1,"b"}` becomes `Insert{i,"ab"}`;
/// `Delete{i,1}, Delete{i,1}` becomes `Delete{i,2}`.
pub fn coalesce(edits: Vec<TextEdit>) -> Vec<TextEdit> {
    let mut out: Vec<TextEdit> = Vec::with_capacity(edits.len());
    for edit in edits {
        if let Some(last) = out.last_mut() {
            if merge_into(last, &edit) {
                continue;
            }
        }
        out.push(edit);
    }
    out
}

fn merge_into(last: &mut TextEdit, next: &TextEdit) -> bool {
    match (last, next) {
        (TextEdit::Insert { index, text }, TextEdit::Insert { index: at, text: more })
            if *index + text.chars().count() == *at =>
        {
            text.push_str(more);
            true
        }
        (TextEdit::Delete { index, len }, TextEdit::Delete { index: at, len: more })
            if *index == *at =>
        {
            *len += *more;
            true
        }
        _ => false,
    }
}
