//! Incremental output accumulation.
//!
//! Evaluations may stream `output_at` fragments before their terminal
//! `output`. Fragments are appended per cell in arrival order; the terminal
//! message stays the source of truth and only borrows the accumulated text
//! when its own `caml_ppf` is empty.

use crate::protocol::EvalOutput;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct OutputAccumulator {
    entries: HashMap<u64, String>,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment for `cell_id`, creating the entry on first use.
    pub fn append(&mut self, cell_id: u64, fragment: &str) {
        self.entries.entry(cell_id).or_default().push_str(fragment);
    }

    /// Fold the accumulated text into a terminal output and drop the entry.
    ///
    /// Returns `true` when the accumulated text replaced an empty `caml_ppf`.
    pub fn merge_into(&mut self, output: &mut EvalOutput) -> bool {
        match self.entries.remove(&output.cell_id) {
            Some(accumulated) if output.caml_ppf.is_empty() && !accumulated.is_empty() => {
                output.caml_ppf = accumulated;
                true
            }
            _ => false,
        }
    }

    /// Drop the entry for a cell that will never see its terminal output.
    pub fn discard(&mut self, cell_id: u64) -> Option<String> {
        self.entries.remove(&cell_id)
    }

    pub fn get(&self, cell_id: u64) -> Option<&str> {
        self.entries.get(&cell_id).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
