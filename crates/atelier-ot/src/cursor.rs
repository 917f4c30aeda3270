//! Cursor positions and their transformation against content edits.
//!
//! Remote cursors are presence data, never persisted. Transforming them
//! against applied operations keeps them from drifting as the document
//! changes under them.

use crate::types::Operation;
use serde::{Deserialize, Serialize};

/// A user's cursor, with an optional selection range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub user_id: String,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

impl Cursor {
    pub fn new(user_id: impl Into<String>, position: usize) -> Self {
        Self {
            user_id: user_id.into(),
            position,
            selection_start: None,
            selection_end: None,
        }
    }

    pub fn with_selection(mut self, start: usize, end: usize) -> Self {
        self.selection_start = Some(start);
        self.selection_end = Some(end);
        self
    }
}

fn shift_position(pos: usize, op: &Operation) -> usize {
    match op {
        Operation::Insert { position, text } => {
            if *position <= pos {
                pos + text.chars().count()
            } else {
                pos
            }
        }
        Operation::Delete { position, count } => {
            if pos >= position + count {
                pos - count
            } else if pos > *position {
                // Inside the deleted range: collapse to the delete start.
                *position
            } else {
                pos
            }
        }
        Operation::Retain { .. } => pos,
    }
}

/// Shift a cursor (and its selection) past an applied operation.
pub fn transform_cursor(cursor: &Cursor, op: &Operation) -> Cursor {
    Cursor {
        user_id: cursor.user_id.clone(),
        position: shift_position(cursor.position, op),
        selection_start: cursor.selection_start.map(|p| shift_position(p, op)),
        selection_end: cursor.selection_end.map(|p| shift_position(p, op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_before_cursor_shifts_right() {
        let cursor = Cursor::new("u", 5);
        let moved = transform_cursor(&cursor, &Operation::insert(2, "abc"));
        assert_eq!(moved.position, 8);
    }

    #[test]
    fn insert_after_cursor_leaves_it() {
        let cursor = Cursor::new("u", 3);
        let moved = transform_cursor(&cursor, &Operation::insert(7, "abc"));
        assert_eq!(moved.position, 3);
    }

    #[test]
    fn delete_before_cursor_shifts_left() {
        let cursor = Cursor::new("u", 8);
        let moved = transform_cursor(&cursor, &Operation::delete(2, 3));
        assert_eq!(moved.position, 5);
    }

    #[test]
    fn delete_spanning_cursor_collapses_to_start() {
        let cursor = Cursor::new("u", 4);
        let moved = transform_cursor(&cursor, &Operation::delete(2, 5));
        assert_eq!(moved.position, 2);
    }

    #[test]
    fn selection_endpoints_move_too() {
        let cursor = Cursor::new("u", 6).with_selection(4, 9);
        let moved = transform_cursor(&cursor, &Operation::insert(0, "xy"));
        assert_eq!(moved.selection_start, Some(6));
        assert_eq!(moved.selection_end, Some(11));
    }
}
