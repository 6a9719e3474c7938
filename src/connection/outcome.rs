use crate::adapter::{ExecStatus, QueryResult};

/// What the most recently finished operation left behind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub(crate) text: String,
    pub(crate) has_result: bool,
    pub(crate) is_null: bool,
    pub(crate) is_error: bool,
}

impl Outcome {
    pub(crate) fn clear(&mut self) {
        self.text.clear();
        self.has_result = false;
        self.is_null = false;
        self.is_error = false;
    }

    /// Handshake failure, lost session or refused submission: raw library
    /// text, no SQLSTATE prefix.
    pub(crate) fn set_connection_error(&mut self, message: String) {
        self.text = message;
        self.has_result = false;
        self.is_null = false;
        self.is_error = true;
    }

    /// Fold one result object in. The last object of a command wins.
    pub(crate) fn absorb(&mut self, result: &QueryResult) {
        if result.status() == ExecStatus::FatalError {
            self.text = match result.sqlstate() {
                Some(code) => format!("{code}_{}", result.error_message()),
                None => String::new(),
            };
            self.has_result = true;
            self.is_null = false;
            self.is_error = true;
        } else if result.ntuples() > 0 && result.nfields() > 0 {
            self.text = result.value(0, 0).unwrap_or_default().to_owned();
            self.has_result = true;
            self.is_null = result.is_null(0, 0);
            self.is_error = false;
        } else {
            self.clear();
        }
    }
}
