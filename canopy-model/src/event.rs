use crate::path::KeyPath;

/// Store-side action that produced a change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum Action {
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
}

impl Action {
    /// Whether this action removes the key.
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            Action::Delete | Action::Expire | Action::CompareAndDelete
        )
    }
}

/// One entry of the store's watch stream.
///
/// `modified` values are monotonically increasing across a stream;
/// `prev_created` is carried by removal events so a consumer can detect
/// that the removal refers to an incarnation it never saw.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChangeEvent {
    pub action: Action,
    pub key: KeyPath,
    pub value: Option<String>,
    pub dir: bool,
    pub modified: u64,
    pub created: Option<u64>,
    /// Remaining time-to-live in whole seconds, if the entry carries one.
    pub ttl: Option<u64>,
    pub prev_created: Option<u64>,
}
