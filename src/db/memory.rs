use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{dedup_ids, DepositAddress, NewUtxo, Utxo, UtxoKey};
use crate::currency::Currency;
use crate::errors::{CustodyError, Result};
use crate::tx::selector::SelectionResult;

#[derive(Default)]
struct State {
    last_id: i64,
    utxos: Vec<Utxo>,
    deposits: Vec<DepositAddress>,
}

/// Process-local ledger. Each operation runs under one mutex, which gives
/// it the same all-or-nothing behaviour as the conditional SQL updates.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert_utxo(&self, utxo: &NewUtxo, now: i64) -> Utxo {
        let mut state = self.state();
        let key = utxo.key();

        if let Some(row) = state.utxos.iter_mut().find(|u| u.key() == key) {
            row.confirmations = utxo.confirmations;
            row.block_height = utxo.block_height;
            if row.status == Utxo::STATUS_UNCONFIRMED || row.status == Utxo::STATUS_CONFIRMED {
                row.status = utxo.status().to_owned();
            }
            row.updated_at = now;
            return row.clone();
        }

        state.last_id += 1;
        let row = Utxo {
            id: state.last_id,
            tx_hash: utxo.tx_hash.clone(),
            vout: utxo.vout,
            currency: utxo.currency.as_str().to_owned(),
            owner_id: utxo.owner_id.clone(),
            address: utxo.address.clone(),
            derivation_path: utxo.derivation_path.clone(),
            amount: utxo.amount,
            status: utxo.status().to_owned(),
            block_height: utxo.block_height,
            confirmations: utxo.confirmations,
            locked_until: None,
            locked_by: None,
            spent_in_tx_hash: None,
            spent_at: None,
            script_pub_key: utxo.script_pub_key.clone(),
            created_at: now,
            updated_at: now,
        };
        state.utxos.push(row.clone());
        row
    }

    pub fn find_utxo(&self, key: &UtxoKey) -> Option<Utxo> {
        self.state().utxos.iter().find(|u| &u.key() == key).cloned()
    }

    pub fn refresh_confirmations(
        &self,
        key: &UtxoKey,
        currency: Currency,
        confirmations: i64,
        block_height: Option<i64>,
        now: i64,
    ) -> bool {
        let mut state = self.state();
        let Some(row) = state.utxos.iter_mut().find(|u| &u.key() == key) else {
            return false;
        };

        row.confirmations = confirmations;
        if block_height.is_some() {
            row.block_height = block_height;
        }
        if row.status == Utxo::STATUS_UNCONFIRMED || row.status == Utxo::STATUS_CONFIRMED {
            row.status = currency.status_for(confirmations).to_owned();
        }
        row.updated_at = now;
        true
    }

    fn available(state: &State, owner: &str, currency: Currency) -> Vec<Utxo> {
        let mut result: Vec<Utxo> = state
            .utxos
            .iter()
            .filter(|u| {
                u.owner_id == owner && u.currency == currency.as_str() && u.is_selectable()
            })
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        result
    }

    pub fn available_utxos(&self, owner: &str, currency: Currency) -> Vec<Utxo> {
        Self::available(&self.state(), owner, currency)
    }

    pub fn available_balance(&self, owner: &str, currency: Currency) -> u64 {
        Self::available(&self.state(), owner, currency)
            .iter()
            .map(|u| u.amount_sat())
            .sum()
    }

    /// Applies `apply` to every row in `ids` if all of them pass `check`,
    /// otherwise leaves the ledger untouched.
    fn transition<C, A>(state: &mut State, ids: &[i64], check: C, apply: A) -> Result<()>
    where
        C: Fn(&Utxo) -> bool,
        A: Fn(&mut Utxo),
    {
        let ids = dedup_ids(ids);
        let wanted: HashSet<i64> = ids.iter().copied().collect();

        let affected = state
            .utxos
            .iter()
            .filter(|u| wanted.contains(&u.id) && check(u))
            .count();
        if affected != ids.len() {
            return Err(CustodyError::LockConflict {
                expected: ids.len(),
                affected,
            });
        }

        for row in state.utxos.iter_mut().filter(|u| wanted.contains(&u.id)) {
            apply(row);
        }
        Ok(())
    }

    fn lock_rows(
        state: &mut State,
        ids: &[i64],
        holder: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<()> {
        Self::transition(
            state,
            ids,
            |u| u.status == Utxo::STATUS_CONFIRMED,
            |u| {
                u.status = Utxo::STATUS_LOCKED.to_owned();
                u.locked_until = Some(expires_at);
                u.locked_by = Some(holder.to_owned());
                u.updated_at = now;
            },
        )
    }

    pub fn lock_utxos(&self, ids: &[i64], holder: &str, expires_at: i64, now: i64) -> Result<()> {
        Self::lock_rows(&mut self.state(), ids, holder, expires_at, now)
    }

    pub fn unlock_utxos(&self, ids: &[i64], now: i64) -> Result<()> {
        Self::transition(
            &mut self.state(),
            ids,
            |u| u.status == Utxo::STATUS_LOCKED,
            |u| {
                u.status = Utxo::STATUS_CONFIRMED.to_owned();
                u.locked_until = None;
                u.locked_by = None;
                u.updated_at = now;
            },
        )
    }

    pub fn mark_spent(&self, ids: &[i64], spent_in_tx_hash: &str, now: i64) -> Result<()> {
        Self::transition(
            &mut self.state(),
            ids,
            |u| u.status == Utxo::STATUS_LOCKED,
            |u| {
                u.status = Utxo::STATUS_SPENT.to_owned();
                u.spent_in_tx_hash = Some(spent_in_tx_hash.to_owned());
                u.spent_at = Some(now);
                u.locked_until = None;
                u.updated_at = now;
            },
        )
    }

    pub fn locked_by(&self, holder: &str) -> Vec<i64> {
        self.state()
            .utxos
            .iter()
            .filter(|u| u.status == Utxo::STATUS_LOCKED && u.locked_by.as_deref() == Some(holder))
            .map(|u| u.id)
            .collect()
    }

    pub fn reap_expired_locks(&self, now: i64) -> u64 {
        let mut state = self.state();
        let mut count = 0;
        for row in state.utxos.iter_mut() {
            let expired = row.locked_until.map(|t| t < now).unwrap_or(false);
            if row.status == Utxo::STATUS_LOCKED && expired {
                row.status = Utxo::STATUS_CONFIRMED.to_owned();
                row.locked_until = None;
                row.locked_by = None;
                row.updated_at = now;
                count += 1;
            }
        }
        count
    }

    pub fn select_and_lock<F>(
        &self,
        owner: &str,
        currency: Currency,
        holder: &str,
        expires_at: i64,
        now: i64,
        select: F,
    ) -> Result<SelectionResult>
    where
        F: FnOnce(&[Utxo]) -> Result<SelectionResult>,
    {
        let mut state = self.state();
        let candidates = Self::available(&state, owner, currency);
        let selection = select(&candidates)?;
        Self::lock_rows(&mut state, &selection.ids(), holder, expires_at, now)?;
        Ok(selection)
    }

    pub fn upsert_deposit_address(
        &self,
        owner: &str,
        currency: Currency,
        address: &str,
        derivation_path: &str,
        now: i64,
    ) -> DepositAddress {
        let mut state = self.state();
        if let Some(row) = state
            .deposits
            .iter_mut()
            .find(|d| d.owner_id == owner && d.currency == currency.as_str())
        {
            row.address = address.to_owned();
            row.derivation_path = derivation_path.to_owned();
            row.updated_at = now;
            return row.clone();
        }

        let row = DepositAddress {
            id: state.deposits.len() as i64 + 1,
            owner_id: owner.to_owned(),
            currency: currency.as_str().to_owned(),
            address: address.to_owned(),
            derivation_path: derivation_path.to_owned(),
            last_checked_balance: 0,
            created_at: now,
            updated_at: now,
        };
        state.deposits.push(row.clone());
        row
    }

    pub fn deposit_addresses(&self, currency: Currency) -> Vec<DepositAddress> {
        let mut result: Vec<DepositAddress> = self
            .state()
            .deposits
            .iter()
            .filter(|d| d.currency == currency.as_str())
            .cloned()
            .collect();
        result.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
        result
    }

    pub fn update_deposit_balance(&self, owner: &str, currency: Currency, balance: i64, now: i64) {
        let mut state = self.state();
        if let Some(row) = state
            .deposits
            .iter_mut()
            .find(|d| d.owner_id == owner && d.currency == currency.as_str())
        {
            row.last_checked_balance = balance;
            row.updated_at = now;
        }
    }
}
