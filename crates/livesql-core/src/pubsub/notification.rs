//! Codec for the payloads sent by the shared trigger function.
//!
//! A payload is `type || table || operation || detail` joined with
//! [`DELIMITER`]. For `data_has_changed` the detail is the comma separated
//! list of matching catalog ids, for `error` it is the database message.

use crate::error::{Error, Result};

/// Field separator of notification payloads.
pub const DELIMITER: &str = "||livesql||";

const DATA_CHANGED: &str = "data_has_changed";
const ERROR: &str = "error";

/// A decoded trigger notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerNotification {
    /// Rows matching the listed conditions were written.
    DataChanged {
        /// Table the statement ran on.
        table: String,
        /// `INSERT`, `UPDATE` or `DELETE`.
        op: String,
        /// Catalog ids of the matching conditions.
        condition_ids: Vec<i64>,
    },
    /// A registered condition failed to evaluate.
    Error {
        /// Table the statement ran on.
        table: String,
        /// Statement kind.
        op: String,
        /// Database message.
        message: String,
    },
}

impl TriggerNotification {
    /// Decodes a raw payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for payloads not produced by the
    /// trigger function.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut parts = payload.splitn(4, DELIMITER);
        let kind = parts.next().unwrap_or_default();
        let (Some(table), Some(op)) = (parts.next(), parts.next()) else {
            return Err(Error::Validation(format!("malformed notification '{payload}'")));
        };
        let detail = parts.next().unwrap_or_default();
        match kind {
            DATA_CHANGED => {
                let condition_ids = detail
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<i64>().map_err(|_| {
                            Error::Validation(format!("invalid condition id '{s}' in notification"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::DataChanged {
                    table: table.to_string(),
                    op: op.to_string(),
                    condition_ids,
                })
            }
            ERROR => Ok(Self::Error {
                table: table.to_string(),
                op: op.to_string(),
                message: detail.to_string(),
            }),
            other => Err(Error::Validation(format!("unknown notification type '{other}'"))),
        }
    }

    /// Encodes the payload exactly as the trigger function does.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::DataChanged {
                table,
                op,
                condition_ids,
            } => {
                let ids: Vec<String> = condition_ids.iter().map(i64::to_string).collect();
                [DATA_CHANGED, table, op, &ids.join(",")].join(DELIMITER)
            }
            Self::Error { table, op, message } => [ERROR, table, op, message].join(DELIMITER),
        }
    }

    /// Table the notification is about.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::DataChanged { table, .. } | Self::Error { table, .. } => table,
        }
    }
}
