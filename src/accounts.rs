//! Account orchestrator.
//!
//! Each account has an exclusive session slot; callers borrow it for the
//! duration of a broker call and release it on drop, including on
//! cancellation or panic. `borrow_with_failover` walks accounts in a
//! stable order (by account_id), trying the preferred account first and
//! falling back to the rest in that fixed order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::warn;

use crate::domain::AccountId;
use crate::errors::GatewayError;

pub struct AccountSession {
    pub account_id: AccountId,
    pub credentials: String,
    lock: Arc<Mutex<()>>,
}

/// RAII lease: releases the account's session slot when dropped, whatever
/// the exit path (normal return, `?`, cancellation, panic unwind).
pub struct AccountLease {
    pub account_id: AccountId,
    _guard: OwnedMutexGuard<()>,
}

pub struct AccountOrchestrator {
    sessions: HashMap<AccountId, AccountSession>,
    order: Vec<AccountId>,
    lease_timeout: Duration,
}

impl AccountOrchestrator {
    pub fn new(accounts: Vec<(AccountId, String)>, lease_timeout: Duration) -> Self {
        let mut order: Vec<AccountId> = accounts.iter().map(|(id, _)| id.clone()).collect();
        order.sort();
        let sessions = accounts
            .into_iter()
            .map(|(account_id, credentials)| {
                let session = AccountSession {
                    account_id: account_id.clone(),
                    credentials,
                    lock: Arc::new(Mutex::new(())),
                };
                (account_id, session)
            })
            .collect();
        Self { sessions, order, lease_timeout }
    }

    pub fn account_ids(&self) -> &[AccountId] {
        &self.order
    }

    pub fn credentials(&self, account_id: &AccountId) -> Option<&str> {
        self.sessions.get(account_id).map(|s| s.credentials.as_str())
    }

    /// Borrow a single named account, waiting up to the lease timeout.
    pub async fn borrow(&self, account_id: &AccountId) -> Result<AccountLease, GatewayError> {
        let session = self
            .sessions
            .get(account_id)
            .ok_or_else(|| GatewayError::Validation(format!("unknown account {account_id}")))?;
        let guard = timeout(self.lease_timeout, session.lock.clone().lock_owned())
            .await
            .map_err(|_| GatewayError::LeaseTimeout)?;
        Ok(AccountLease { account_id: account_id.clone(), _guard: guard })
    }

    /// Try the preferred account first, then every other account in stable
    /// order, taking the first one whose slot is immediately free. Returns
    /// `AllAccountsLimited` only after every account has been tried.
    pub async fn borrow_with_failover(
        &self,
        preferred: Option<&AccountId>,
    ) -> Result<AccountLease, GatewayError> {
        let mut candidates: Vec<&AccountId> = Vec::with_capacity(self.order.len());
        if let Some(p) = preferred {
            candidates.push(p);
        }
        candidates.extend(self.order.iter().filter(|id| Some(*id) != preferred));

        for account_id in candidates {
            let Some(session) = self.sessions.get(account_id) else { continue };
            match session.lock.clone().try_lock_owned() {
                Ok(guard) => return Ok(AccountLease { account_id: account_id.clone(), _guard: guard }),
                Err(_) => {
                    warn!(%account_id, "account session busy, trying next");
                    continue;
                }
            }
        }
        Err(GatewayError::AllAccountsLimited)
    }
}
