//! RG CLI - key management and message encryption
//!
//! This crate provides a command-line interface for:
//! - Generating device keys and exporting signed key cards
//! - Importing peer key cards and managing trust
//! - Encrypting and decrypting text messages and files

pub mod cli;
pub mod context;
pub mod output;

pub use cli::Cli;
pub use output::{OutputFormat, OutputFormatter};

use rg_core::decrypt::DecryptStatus;

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Invalid input (bad arguments, unreadable container)
/// - 3: Need key - local device is not a recipient
/// - 4: Bad signature
/// - 5: Tampered - ciphertext hash mismatch
/// - 6: Decryption failed
/// - 7: Replay - envelope already seen under another message id
/// - 8: No recipients - no trusted keys for the requested peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidInput = 2,
    NeedKey = 3,
    BadSignature = 4,
    Tampered = 5,
    DecryptFailed = 6,
    Replay = 7,
    NoRecipients = 8,
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::NeedKey => "NEED_KEY",
            ExitCode::BadSignature => "BAD_SIGNATURE",
            ExitCode::Tampered => "TAMPERED",
            ExitCode::DecryptFailed => "DECRYPT_FAILED",
            ExitCode::Replay => "REPLAY",
            ExitCode::NoRecipients => "NO_RECIPIENTS",
        }
    }
}

impl From<DecryptStatus> for ExitCode {
    fn from(status: DecryptStatus) -> Self {
        match status {
            DecryptStatus::Ok => ExitCode::Success,
            DecryptStatus::NeedKey => ExitCode::NeedKey,
            DecryptStatus::BadSignature => ExitCode::BadSignature,
            DecryptStatus::BadHash => ExitCode::Tampered,
            DecryptStatus::DecryptFail => ExitCode::DecryptFailed,
            DecryptStatus::ParseFail => ExitCode::InvalidInput,
        }
    }
}
