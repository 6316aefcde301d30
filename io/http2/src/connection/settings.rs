//! HTTP/2 connection settings.
//!
//! Each connection keeps two copies: the local settings we advertise and
//! the remote settings the peer has sent us. Local changes go out as a diff
//! against what the peer last acknowledged; every SETTINGS frame we send is
//! queued in [`PendingSettings`] until its ACK arrives.

use std::collections::VecDeque;

use crate::frame::{self, ErrorCode, FrameError, Setting, SettingId, SettingsFrame};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("SETTINGS ACK with no settings pending")]
    UnexpectedAck,
    #[error(transparent)]
    Invalid(#[from] FrameError),
}

impl SettingsError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SettingsError::UnexpectedAck => ErrorCode::ProtocolError,
            SettingsError::Invalid(e) => e.error_code(),
        }
    }
}

/// Negotiated connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

/// The values every endpoint starts from (RFC 7540 Section 6.5.2).
/// Unlimited parameters are `u32::MAX`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: frame::DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Settings {
    /// Settings a server advertises unless configured otherwise.
    pub fn server() -> Self {
        Self {
            max_concurrent_streams: frame::DEFAULT_MAX_CONCURRENT_STREAMS,
            max_header_list_size: frame::DEFAULT_MAX_HEADER_LIST_SIZE,
            ..Self::default()
        }
    }

    pub fn header_table_size(mut self, value: u32) -> Self {
        self.header_table_size = value;
        self
    }

    pub fn max_concurrent_streams(mut self, value: u32) -> Self {
        self.max_concurrent_streams = value;
        self
    }

    pub fn initial_window_size(mut self, value: u32) -> Self {
        self.initial_window_size = value;
        self
    }

    pub fn max_frame_size(mut self, value: u32) -> Self {
        self.max_frame_size = value;
        self
    }

    pub fn max_header_list_size(mut self, value: u32) -> Self {
        self.max_header_list_size = value;
        self
    }

    /// Parameters in `self` that differ from `previous`, in identifier order.
    pub fn diff(&self, previous: &Settings) -> Vec<Setting> {
        let mut changed = Vec::new();
        let mut push = |id, value: u32, old: u32| {
            if value != old {
                changed.push(Setting { id, value });
            }
        };
        push(
            SettingId::HeaderTableSize,
            self.header_table_size,
            previous.header_table_size,
        );
        push(
            SettingId::EnablePush,
            self.enable_push as u32,
            previous.enable_push as u32,
        );
        push(
            SettingId::MaxConcurrentStreams,
            self.max_concurrent_streams,
            previous.max_concurrent_streams,
        );
        push(
            SettingId::InitialWindowSize,
            self.initial_window_size,
            previous.initial_window_size,
        );
        push(
            SettingId::MaxFrameSize,
            self.max_frame_size,
            previous.max_frame_size,
        );
        push(
            SettingId::MaxHeaderListSize,
            self.max_header_list_size,
            previous.max_header_list_size,
        );
        changed
    }

    /// Apply received parameters. Unknown identifiers are ignored; values out
    /// of range leave `self` untouched.
    pub fn apply(&mut self, settings: &[Setting]) -> Result<(), SettingsError> {
        let mut next = *self;
        for setting in settings {
            frame::validate_setting(setting.id, setting.value)?;
            match setting.id {
                SettingId::HeaderTableSize => next.header_table_size = setting.value,
                SettingId::EnablePush => next.enable_push = setting.value == 1,
                SettingId::MaxConcurrentStreams => next.max_concurrent_streams = setting.value,
                SettingId::InitialWindowSize => next.initial_window_size = setting.value,
                SettingId::MaxFrameSize => next.max_frame_size = setting.value,
                SettingId::MaxHeaderListSize => next.max_header_list_size = setting.value,
                SettingId::Unknown(_) => {}
            }
        }
        *self = next;
        Ok(())
    }

    /// Check every parameter against its protocol range.
    pub fn validate(&self) -> Result<(), SettingsError> {
        frame::validate_setting(SettingId::InitialWindowSize, self.initial_window_size)?;
        frame::validate_setting(SettingId::MaxFrameSize, self.max_frame_size)?;
        Ok(())
    }
}

/// SETTINGS frames sent and not yet acknowledged, oldest first.
#[derive(Debug, Default)]
pub struct PendingSettings {
    queue: VecDeque<Settings>,
}

impl PendingSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `next` as sent and build the frame carrying its diff against
    /// the newest settings the peer will have seen.
    pub fn push(&mut self, acked: &Settings, next: Settings) -> SettingsFrame {
        let base = self.queue.back().unwrap_or(acked);
        let settings = next.diff(base);
        self.queue.push_back(next);
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Consume an ACK, returning the settings now in effect.
    pub fn ack(&mut self) -> Result<Settings, SettingsError> {
        self.queue.pop_front().ok_or(SettingsError::UnexpectedAck)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
