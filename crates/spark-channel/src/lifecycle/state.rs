use std::fmt;

/// 通信对象的生命周期状态。
///
/// `Created → Opening → Opened → Closing → Closed`，`Faulted` 可由任意非终态进入。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    /// `Closed` 与 `Faulted` 之后不再有正常的状态迁移。
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
