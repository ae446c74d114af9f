//! Request handlers
//!
//! Turns a decoded request into a reply for the requester, or into a decision
//! to relay it to the bank that owns the account.

use crate::ledger::{Ledger, LedgerError};
use crate::network::message::{ProtocolError, Request, Response};
use crate::network::segment::AccountRef;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

/// Errors answered to the requester with an ER line
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What to do with a handled request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this reply back on the same connection
    Reply(Response),
    /// The account belongs to `bank`; relay the request there and reply nothing
    Proxy { bank: Ipv4Addr, request: Request },
}

/// Handles requests against the local ledger
#[derive(Clone)]
pub struct RequestHandler {
    ledger: Arc<dyn Ledger>,
    bank_code: Ipv4Addr,
}

impl RequestHandler {
    pub fn new(ledger: Arc<dyn Ledger>, bank_code: Ipv4Addr) -> Self {
        Self { ledger, bank_code }
    }

    /// This node's bank code
    pub fn bank_code(&self) -> Ipv4Addr {
        self.bank_code
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Decode and handle a raw request line
    pub fn dispatch(&self, line: &str) -> Result<Outcome, HandlerError> {
        let request = Request::decode(line)?;
        self.handle(request)
    }

    pub fn handle(&self, request: Request) -> Result<Outcome, HandlerError> {
        if let Some(AccountRef { bank, .. }) = request.account() {
            if bank != self.bank_code {
                return Ok(Outcome::Proxy { bank, request });
            }
        }

        let ledger = &self.ledger;
        let response = match request {
            Request::BankCode => Response::BankCode { ip: self.bank_code },
            Request::BankAmount => Response::BankAmount {
                amount: ledger.total_balance()?,
            },
            Request::BankNumber => Response::BankNumber {
                count: i64::try_from(ledger.account_count()?).unwrap_or(i64::MAX),
            },
            Request::AccountCreate => {
                let number = ledger.open_account(self.bank_code)?;
                Response::AccountCreate {
                    account: AccountRef::new(number, self.bank_code),
                }
            }
            Request::AccountDeposit { account, amount } => {
                ledger.deposit(account.number, account.bank, amount)?;
                Response::AccountDeposit
            }
            Request::AccountWithdraw { account, amount } => {
                ledger.withdraw(account.number, account.bank, amount)?;
                Response::AccountWithdraw
            }
            Request::AccountBalance { account } => Response::AccountBalance {
                amount: ledger.balance(account.number, account.bank)?,
            },
            Request::AccountRemove { account } => {
                ledger.remove(account.number, account.bank)?;
                Response::AccountRemove
            }
            Request::RobberyPlan { text, .. } => Response::RobberyPlan { text },
        };
        Ok(Outcome::Reply(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn handler() -> RequestHandler {
        RequestHandler::new(Arc::new(MemoryLedger::new()), LOCAL)
    }

    fn reply(handler: &RequestHandler, line: &str) -> Response {
        match handler.dispatch(line).unwrap() {
            Outcome::Reply(response) => response,
            other => panic!("Expected a reply, got {:?}", other),
        }
    }

    fn create(handler: &RequestHandler) -> AccountRef {
        match reply(handler, "AC") {
            Response::AccountCreate { account } => account,
            other => panic!("Unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_bank_code() {
        assert_eq!(reply(&handler(), "BC"), Response::BankCode { ip: LOCAL });
    }

    #[test]
    fn test_account_create_is_distinct() {
        let handler = handler();
        let a = create(&handler);
        let b = create(&handler);
        assert_ne!(a.number, b.number);
        assert_eq!(a.bank, LOCAL);
    }

    #[test]
    fn test_deposit_withdraw_balance() {
        let handler = handler();
        let acc = create(&handler);

        assert_eq!(reply(&handler, &format!("AD {} 100", acc)), Response::AccountDeposit);
        assert_eq!(reply(&handler, &format!("AW {} 40", acc)), Response::AccountWithdraw);
        assert_eq!(
            reply(&handler, &format!("AB {}", acc)),
            Response::AccountBalance { amount: 60 }
        );

        let err = handler.dispatch(&format!("AW {} 61", acc)).unwrap_err();
        assert!(matches!(err, HandlerError::Ledger(LedgerError::InsufficientFunds)));
        assert_eq!(
            reply(&handler, &format!("AB {}", acc)),
            Response::AccountBalance { amount: 60 }
        );
    }

    #[test]
    fn test_remove() {
        let handler = handler();
        let empty = create(&handler);
        let funded = create(&handler);
        reply(&handler, &format!("AD {} 9", funded));

        assert_eq!(reply(&handler, &format!("AR {}", empty)), Response::AccountRemove);
        let err = handler.dispatch(&format!("AB {}", empty)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        assert!(handler.dispatch(&format!("AR {}", funded)).is_err());
        assert_eq!(
            reply(&handler, &format!("AB {}", funded)),
            Response::AccountBalance { amount: 9 }
        );
    }

    #[test]
    fn test_removed_account_number_not_reissued() {
        let handler = handler();
        let first = create(&handler);
        assert_eq!(reply(&handler, &format!("AR {}", first)), Response::AccountRemove);

        let second = create(&handler);
        assert_ne!(first, second);
        assert!(handler.dispatch(&format!("AB {}", first)).is_err());
    }

    #[test]
    fn test_bank_totals() {
        let handler = handler();
        let a = create(&handler);
        let b = create(&handler);
        reply(&handler, &format!("AD {} 30", a));
        reply(&handler, &format!("AD {} 12", b));
        assert_eq!(reply(&handler, "BA"), Response::BankAmount { amount: 42 });
        assert_eq!(reply(&handler, "BN"), Response::BankNumber { count: 2 });
    }

    #[test]
    fn test_foreign_account_is_proxied() {
        let handler = handler();
        let outcome = handler.dispatch("AD 10001/10.0.0.2 50").unwrap();
        assert_eq!(
            outcome,
            Outcome::Proxy {
                bank: REMOTE,
                request: Request::AccountDeposit {
                    account: AccountRef::new(10001, REMOTE),
                    amount: 50,
                },
            }
        );
        // Nothing touched the local ledger
        assert_eq!(handler.ledger().account_count().unwrap(), 0);
    }

    #[test]
    fn test_robbery_plan_echoes_text() {
        assert_eq!(
            reply(&handler(), "RP 5000 hit 10.0.0.2 first"),
            Response::RobberyPlan {
                text: "hit 10.0.0.2 first".to_string()
            }
        );
    }

    #[test]
    fn test_parse_error_surfaces() {
        let err = handler().dispatch("ZZ").unwrap_err();
        assert_eq!(err.to_string(), "Unknown message kind: ZZ");
    }
}
