//! Bank protocol message catalog
//!
//! Every message is one ASCII line whose first token is a two-letter kind
//! code. Each kind declares which segments its request and response forms
//! carry; decoding and encoding walk that declaration with the shared segment
//! codecs.

use crate::network::segment::{AccountRef, LineBuilder, Tokens};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Protocol parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
    #[error("{0} is not a request")]
    NotARequest(MessageKind),
    #[error("Expected {expected} message, got {found}")]
    KindMismatch {
        expected: MessageKind,
        found: MessageKind,
    },
    #[error("Missing {0} segment")]
    MissingSegment(&'static str),
    #[error("Invalid ip address: {0}")]
    InvalidIp(String),
    #[error("Invalid account: {0}")]
    InvalidAccount(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Unexpected {0} trailing token(s)")]
    TrailingTokens(usize),
}

/// Message kinds, in classification order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MessageKind {
    /// Bank code
    BankCode,
    /// Total amount held by the bank
    BankAmount,
    /// Number of accounts held by the bank
    BankNumber,
    /// Open an account
    AccountCreate,
    /// Deposit into an account
    AccountDeposit,
    /// Withdraw from an account
    AccountWithdraw,
    /// Account balance
    AccountBalance,
    /// Remove an account
    AccountRemove,
    /// Robbery plan
    RobberyPlan,
    /// Error reply
    Error,
}

impl MessageKind {
    pub const COUNT: usize = 10;

    pub const ALL: [MessageKind; Self::COUNT] = [
        MessageKind::BankCode,
        MessageKind::BankAmount,
        MessageKind::BankNumber,
        MessageKind::AccountCreate,
        MessageKind::AccountDeposit,
        MessageKind::AccountWithdraw,
        MessageKind::AccountBalance,
        MessageKind::AccountRemove,
        MessageKind::RobberyPlan,
        MessageKind::Error,
    ];

    /// Two-letter wire code
    pub fn code(self) -> &'static str {
        match self {
            MessageKind::BankCode => "BC",
            MessageKind::BankAmount => "BA",
            MessageKind::BankNumber => "BN",
            MessageKind::AccountCreate => "AC",
            MessageKind::AccountDeposit => "AD",
            MessageKind::AccountWithdraw => "AW",
            MessageKind::AccountBalance => "AB",
            MessageKind::AccountRemove => "AR",
            MessageKind::RobberyPlan => "RP",
            MessageKind::Error => "ER",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Kind of a raw line, if its first token is a known code
    pub fn of_line(line: &str) -> Option<Self> {
        line.split_whitespace().next()?.parse().ok()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

/// Split a line into its kind and the remaining tokens
///
/// The kind is the whole first whitespace-delimited token, so `ADX 1` is an
/// unknown kind `ADX` rather than `AD` with junk attached.
fn split_kind(line: &str) -> Result<(MessageKind, Tokens<'_>), ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let (head, rest) = line
        .split_once(char::is_whitespace)
        .unwrap_or((line, ""));
    Ok((head.parse()?, Tokens::new(rest)))
}

/// A request as sent by a client or a peer bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    BankCode,
    BankAmount,
    BankNumber,
    AccountCreate,
    AccountDeposit { account: AccountRef, amount: i64 },
    AccountWithdraw { account: AccountRef, amount: i64 },
    AccountBalance { account: AccountRef },
    AccountRemove { account: AccountRef },
    RobberyPlan { amount: i64, text: String },
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::BankCode => MessageKind::BankCode,
            Request::BankAmount => MessageKind::BankAmount,
            Request::BankNumber => MessageKind::BankNumber,
            Request::AccountCreate => MessageKind::AccountCreate,
            Request::AccountDeposit { .. } => MessageKind::AccountDeposit,
            Request::AccountWithdraw { .. } => MessageKind::AccountWithdraw,
            Request::AccountBalance { .. } => MessageKind::AccountBalance,
            Request::AccountRemove { .. } => MessageKind::AccountRemove,
            Request::RobberyPlan { .. } => MessageKind::RobberyPlan,
        }
    }

    /// The account this request operates on, if any
    pub fn account(&self) -> Option<AccountRef> {
        match self {
            Request::AccountDeposit { account, .. }
            | Request::AccountWithdraw { account, .. }
            | Request::AccountBalance { account }
            | Request::AccountRemove { account } => Some(*account),
            _ => None,
        }
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (kind, mut tokens) = split_kind(line)?;
        let request = match kind {
            MessageKind::BankCode => Request::BankCode,
            MessageKind::BankAmount => Request::BankAmount,
            MessageKind::BankNumber => Request::BankNumber,
            MessageKind::AccountCreate => Request::AccountCreate,
            MessageKind::AccountDeposit => {
                let amount = tokens.amount()?;
                let account = tokens.account()?;
                Request::AccountDeposit { account, amount }
            }
            MessageKind::AccountWithdraw => {
                let amount = tokens.amount()?;
                let account = tokens.account()?;
                Request::AccountWithdraw { account, amount }
            }
            MessageKind::AccountBalance => Request::AccountBalance {
                account: tokens.account()?,
            },
            MessageKind::AccountRemove => Request::AccountRemove {
                account: tokens.account()?,
            },
            MessageKind::RobberyPlan => {
                let text = tokens.text(1)?;
                let amount = tokens.amount()?;
                Request::RobberyPlan { amount, text }
            }
            MessageKind::Error => return Err(ProtocolError::NotARequest(kind)),
        };
        tokens.finish()?;
        Ok(request)
    }

    pub fn encode(&self) -> String {
        let line = LineBuilder::new(self.kind());
        let line = match self {
            Request::BankCode
            | Request::BankAmount
            | Request::BankNumber
            | Request::AccountCreate => line,
            Request::AccountDeposit { account, amount }
            | Request::AccountWithdraw { account, amount } => {
                line.account(*account).amount(*amount)
            }
            Request::AccountBalance { account } | Request::AccountRemove { account } => {
                line.account(*account)
            }
            Request::RobberyPlan { amount, text } => line.amount(*amount).text(text),
        };
        line.build()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A response to a request, or an error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    BankCode { ip: Ipv4Addr },
    BankAmount { amount: i64 },
    BankNumber { count: i64 },
    AccountCreate { account: AccountRef },
    AccountDeposit,
    AccountWithdraw,
    AccountBalance { amount: i64 },
    AccountRemove,
    RobberyPlan { text: String },
    Error { text: String },
}

impl Response {
    pub fn error(text: impl Into<String>) -> Self {
        Response::Error { text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Response::BankCode { .. } => MessageKind::BankCode,
            Response::BankAmount { .. } => MessageKind::BankAmount,
            Response::BankNumber { .. } => MessageKind::BankNumber,
            Response::AccountCreate { .. } => MessageKind::AccountCreate,
            Response::AccountDeposit => MessageKind::AccountDeposit,
            Response::AccountWithdraw => MessageKind::AccountWithdraw,
            Response::AccountBalance { .. } => MessageKind::AccountBalance,
            Response::AccountRemove => MessageKind::AccountRemove,
            Response::RobberyPlan { .. } => MessageKind::RobberyPlan,
            Response::Error { .. } => MessageKind::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    /// Decode a line using the response shape of its own kind
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (kind, _) = split_kind(line)?;
        Self::decode_as(kind, line)
    }

    /// Decode a line, requiring it to be a response of `expected` kind
    pub fn decode_as(expected: MessageKind, line: &str) -> Result<Self, ProtocolError> {
        let (found, mut tokens) = split_kind(line)?;
        if found != expected {
            return Err(ProtocolError::KindMismatch { expected, found });
        }
        let response = match expected {
            MessageKind::BankCode => Response::BankCode { ip: tokens.ip()? },
            MessageKind::BankAmount => Response::BankAmount {
                amount: tokens.amount()?,
            },
            MessageKind::BankNumber => Response::BankNumber {
                count: tokens.amount()?,
            },
            MessageKind::AccountCreate => Response::AccountCreate {
                account: tokens.account()?,
            },
            MessageKind::AccountDeposit => Response::AccountDeposit,
            MessageKind::AccountWithdraw => Response::AccountWithdraw,
            MessageKind::AccountBalance => Response::AccountBalance {
                amount: tokens.amount()?,
            },
            MessageKind::AccountRemove => Response::AccountRemove,
            MessageKind::RobberyPlan => Response::RobberyPlan {
                text: tokens.text(0)?,
            },
            MessageKind::Error => Response::Error {
                text: tokens.text(0)?,
            },
        };
        tokens.finish()?;
        Ok(response)
    }

    pub fn encode(&self) -> String {
        let line = LineBuilder::new(self.kind());
        let line = match self {
            Response::BankCode { ip } => line.ip(*ip),
            Response::BankAmount { amount } | Response::AccountBalance { amount } => {
                line.amount(*amount)
            }
            Response::BankNumber { count } => line.amount(*count),
            Response::AccountCreate { account } => line.account(*account),
            Response::AccountDeposit | Response::AccountWithdraw | Response::AccountRemove => {
                line
            }
            Response::RobberyPlan { text } | Response::Error { text } => line.text(text),
        };
        line.build()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
