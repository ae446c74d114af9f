//! Outstanding request bookkeeping for one connection
//!
//! Wire responses carry no request id, so a received line is matched against
//! what this connection is still waiting for: its own requests (counted per
//! kind), the unsolicited bank-code handshake, and requests relayed on behalf
//! of other connections (proxy registrations, FIFO).
//!
//! When a response of kind K could belong to either a local request or a
//! proxy registration, the oldest proxy registration of kind K wins. ER
//! carries nothing that identifies its kind; it goes to the oldest proxy
//! registration only while proxy registrations outnumber local requests.

use crate::network::message::{MessageKind, Response};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// A request relayed on behalf of another connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRegistration {
    /// Remote address of the connection the request came from
    pub origin: SocketAddr,
    pub kind: MessageKind,
}

/// Result of matching a received line against outstanding requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Reply to a request this node sent
    Local(Response),
    /// Reply to a relayed request; goes back to `origin`
    Proxied { origin: SocketAddr, response: Response },
}

#[derive(Debug, Default)]
pub struct Outstanding {
    expected: [usize; MessageKind::COUNT],
    awaiting_bank_code: bool,
    proxied: VecDeque<ProxyRegistration>,
}

impl Outstanding {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handshake BC was sent; its reply is not counted per kind
    pub fn expect_bank_code(&mut self) {
        self.awaiting_bank_code = true;
    }

    /// A local request of `kind` is about to be sent
    pub fn expect(&mut self, kind: MessageKind) {
        self.expected[kind.index()] += 1;
    }

    /// A relayed request of `kind` from `origin` is about to be sent
    pub fn register_proxy(&mut self, origin: SocketAddr, kind: MessageKind) {
        self.proxied.push_back(ProxyRegistration { origin, kind });
    }

    pub fn expected(&self, kind: MessageKind) -> usize {
        self.expected[kind.index()]
    }

    pub fn total_expected(&self) -> usize {
        self.expected.iter().sum()
    }

    pub fn pending_proxies(&self) -> usize {
        self.proxied.len()
    }

    pub fn awaiting_bank_code(&self) -> bool {
        self.awaiting_bank_code
    }

    fn has_proxy(&self, kind: MessageKind) -> bool {
        self.proxied.iter().any(|r| r.kind == kind)
    }

    fn is_candidate(&self, kind: MessageKind) -> bool {
        kind == MessageKind::Error
            || self.expected(kind) > 0
            || self.has_proxy(kind)
            || (kind == MessageKind::BankCode && self.awaiting_bank_code)
    }

    /// Try to read `line` as a response to something outstanding.
    ///
    /// Returns `None` when the line fits no outstanding response shape and
    /// should be handled as a fresh request. A classified line is retired
    /// from the bookkeeping before returning.
    pub fn classify(&mut self, line: &str) -> Option<Classified> {
        let response = MessageKind::ALL
            .into_iter()
            .filter(|kind| self.is_candidate(*kind))
            .find_map(|kind| Response::decode_as(kind, line).ok())?;
        Some(self.attribute(response))
    }

    fn attribute(&mut self, response: Response) -> Classified {
        let kind = response.kind();

        let slot = if kind == MessageKind::Error {
            if self.proxied.len() > self.total_expected() {
                Some(0)
            } else {
                None
            }
        } else {
            self.proxied.iter().position(|r| r.kind == kind)
        };

        if let Some(registration) = slot.and_then(|i| self.proxied.remove(i)) {
            return Classified::Proxied {
                origin: registration.origin,
                response,
            };
        }

        self.retire_local(kind);
        Classified::Local(response)
    }

    fn retire_local(&mut self, kind: MessageKind) {
        if kind == MessageKind::BankCode && self.awaiting_bank_code {
            self.awaiting_bank_code = false;
            return;
        }
        // An error answers one of our requests; which one is unknowable.
        let index = if kind == MessageKind::Error {
            self.expected.iter().position(|n| *n > 0)
        } else {
            Some(kind.index())
        };
        if let Some(count) = index.map(|i| &mut self.expected[i]) {
            *count = count.saturating_sub(1);
        }
    }

    /// Drop every proxy registration, returning the abandoned ones
    pub fn abandon(&mut self) -> Vec<ProxyRegistration> {
        self.proxied.drain(..).collect()
    }
}
