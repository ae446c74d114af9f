//! Segment codecs shared by every message kind
//!
//! After the two-letter kind token a line is a list of whitespace-separated
//! tokens. Segments are decoded outermost-first by stripping tokens off the
//! end of the line, and encoded in the opposite order by appending them.

use crate::network::message::{MessageKind, ProtocolError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Reduce an address to the dotted-quad form used as a bank code.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are unwrapped; any other
/// IPv6 address has no bank code.
pub fn normalize_ip(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Parse a bank code, accepting IPv4-mapped IPv6 notation
pub fn parse_bank_code(token: &str) -> Result<Ipv4Addr, ProtocolError> {
    token
        .parse::<IpAddr>()
        .ok()
        .and_then(normalize_ip)
        .ok_or_else(|| ProtocolError::InvalidIp(token.to_string()))
}

/// An account number together with the bank code of the node that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountRef {
    pub number: u64,
    pub bank: Ipv4Addr,
}

impl AccountRef {
    pub fn new(number: u64, bank: Ipv4Addr) -> Self {
        Self { number, bank }
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.bank)
    }
}

impl FromStr for AccountRef {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidAccount(s.to_string());
        let (number, bank) = s.split_once('/').ok_or_else(invalid)?;
        let number = number.parse::<u64>().map_err(|_| invalid())?;
        let bank = parse_bank_code(bank).map_err(|_| invalid())?;
        Ok(Self { number, bank })
    }
}

/// Tokens of a line that follow the kind, consumed from the back
pub struct Tokens<'a> {
    items: Vec<&'a str>,
}

impl<'a> Tokens<'a> {
    pub fn new(rest: &'a str) -> Self {
        Self {
            items: rest.split_whitespace().collect(),
        }
    }

    fn pop(&mut self, segment: &'static str) -> Result<&'a str, ProtocolError> {
        self.items
            .pop()
            .ok_or(ProtocolError::MissingSegment(segment))
    }

    pub fn ip(&mut self) -> Result<Ipv4Addr, ProtocolError> {
        parse_bank_code(self.pop("ip address")?)
    }

    pub fn account(&mut self) -> Result<AccountRef, ProtocolError> {
        self.pop("account")?.parse()
    }

    pub fn amount(&mut self) -> Result<i64, ProtocolError> {
        let token = self.pop("amount")?;
        token
            .parse::<i64>()
            .map_err(|_| ProtocolError::InvalidAmount(token.to_string()))
    }

    /// Take the free text, leaving `inner` tokens for the segments before it.
    pub fn text(&mut self, inner: usize) -> Result<String, ProtocolError> {
        if self.items.len() <= inner {
            return Err(ProtocolError::MissingSegment("text"));
        }
        Ok(self.items.split_off(inner).join(" "))
    }

    /// Every declared segment has been consumed; nothing may be left over.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.items.len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingTokens(n)),
        }
    }
}

/// Builds a wire line by appending segments after the kind token
pub struct LineBuilder {
    line: String,
}

impl LineBuilder {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            line: kind.code().to_string(),
        }
    }

    fn push(mut self, token: impl fmt::Display) -> Self {
        self.line.push(' ');
        self.line.push_str(&token.to_string());
        self
    }

    pub fn ip(self, ip: Ipv4Addr) -> Self {
        self.push(ip)
    }

    pub fn account(self, account: AccountRef) -> Self {
        self.push(account)
    }

    pub fn amount(self, amount: i64) -> Self {
        self.push(amount)
    }

    pub fn text(self, text: &str) -> Self {
        let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
        self.push(joined)
    }

    pub fn build(self) -> String {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mapped_ipv6() {
        let mapped: IpAddr = "::ffff:203.0.113.7".parse().unwrap();
        assert_eq!(normalize_ip(mapped), Some(Ipv4Addr::new(203, 0, 113, 7)));

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(normalize_ip(v6), None);
    }

    #[test]
    fn test_account_ref_parse() {
        let account: AccountRef = "12345/::ffff:10.0.0.1".parse().unwrap();
        assert_eq!(account.number, 12345);
        assert_eq!(account.bank, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(account.to_string(), "12345/10.0.0.1");

        assert!("-1/10.0.0.1".parse::<AccountRef>().is_err());
        assert!("12345".parse::<AccountRef>().is_err());
        assert!("12345/bank".parse::<AccountRef>().is_err());
    }

    #[test]
    fn test_tokens_strip_from_the_back() {
        let mut tokens = Tokens::new("1/10.0.0.1 500");
        assert_eq!(tokens.amount().unwrap(), 500);
        assert_eq!(tokens.account().unwrap().number, 1);
        assert!(tokens.finish().is_ok());
    }

    #[test]
    fn test_text_leaves_inner_tokens() {
        let mut tokens = Tokens::new("42 rob   the vault");
        assert_eq!(tokens.text(1).unwrap(), "rob the vault");
        assert_eq!(tokens.amount().unwrap(), 42);
        assert!(tokens.finish().is_ok());

        let mut tokens = Tokens::new("42");
        assert!(matches!(
            tokens.text(1),
            Err(ProtocolError::MissingSegment("text"))
        ));
    }

    #[test]
    fn test_leftover_tokens_rejected() {
        let mut tokens = Tokens::new("1 2");
        tokens.amount().unwrap();
        assert!(matches!(
            tokens.finish(),
            Err(ProtocolError::TrailingTokens(1))
        ));
    }
}
