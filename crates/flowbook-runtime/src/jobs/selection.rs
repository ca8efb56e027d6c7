//! Operator selection over a finished job's result items

use serde::{Deserialize, Serialize};

use crate::blocks::OutputBinding;
use crate::execution::BlockOutput;
use crate::jobs::{AsyncJobStatus, JobError, JobState, ResearchItem};
use crate::variables::VariableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "camelCase")]
pub enum SelectionChange {
    Toggle(usize),
    SelectAll,
    ClearAll,
}

impl AsyncJobStatus {
    fn items(&self) -> Result<&[ResearchItem], JobError> {
        match (&self.status, &self.result) {
            (JobState::Complete, Some(result)) => Ok(&result.items),
            _ => Err(JobError::NotFinished),
        }
    }

    pub fn apply_selection(&mut self, change: SelectionChange) -> Result<(), JobError> {
        let count = self.items()?.len();
        match change {
            SelectionChange::Toggle(index) if index >= count => {
                return Err(JobError::InvalidSelection(index));
            }
            SelectionChange::Toggle(index) => {
                if !self.selected.remove(&index) {
                    self.selected.insert(index);
                }
            }
            SelectionChange::SelectAll => self.selected = (0..count).collect(),
            SelectionChange::ClearAll => self.selected.clear(),
        }
        Ok(())
    }

    /// Selected items in result order
    pub fn selected_items(&self) -> Vec<&ResearchItem> {
        let Ok(items) = self.items() else {
            return Vec::new();
        };
        self.selected
            .iter()
            .filter_map(|index| items.get(*index))
            .collect()
    }
}

/// Write the selected item URLs into a block's output binding.
///
/// A scalar binding receives the URLs joined by `delimiter`; a table column binding gets
/// one new row per URL. Returns the number of items written.
pub(crate) async fn save_selection(
    status: &AsyncJobStatus,
    binding: &OutputBinding,
    store: &VariableStore,
    delimiter: &str,
) -> Result<usize, JobError> {
    status.items()?;
    let urls: Vec<String> = status
        .selected_items()
        .into_iter()
        .map(|item| item.url.clone())
        .collect();
    let count = urls.len();

    binding
        .write(store, BlockOutput::List(urls), delimiter)
        .await?;
    Ok(count)
}
