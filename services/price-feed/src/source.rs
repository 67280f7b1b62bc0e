//! Calendar text providers
//!
//! The calendar file is refreshed out-of-band (weekly) by a separate job.
//! Sources hand the producer the current contents in one piece, so a file
//! replaced between ticks is seen either entirely old or entirely new.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use types::errors::CalendarError;

#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Current raw calendar text.
    async fn load(&self) -> Result<String, CalendarError>;
}

/// Reads an `.ics` file from disk on every call.
#[derive(Debug, Clone)]
pub struct FileCalendar {
    path: PathBuf,
}

impl FileCalendar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CalendarSource for FileCalendar {
    async fn load(&self) -> Result<String, CalendarError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                CalendarError::NotFound {
                    path: self.path.display().to_string(),
                }
            } else {
                CalendarError::Io(err)
            }
        })?;
        String::from_utf8(bytes).map_err(|_| CalendarError::InvalidEncoding {
            path: self.path.display().to_string(),
        })
    }
}

/// Fixed calendar text, e.g. for running without a refresh job.
#[derive(Debug, Clone, Default)]
pub struct StaticCalendar {
    text: String,
}

impl StaticCalendar {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl CalendarSource for StaticCalendar {
    async fn load(&self) -> Result<String, CalendarError> {
        Ok(self.text.clone())
    }
}
