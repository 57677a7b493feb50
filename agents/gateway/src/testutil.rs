//! In-memory doubles for the store traits and a scripted provider, shared by
//! the unit tests across modules.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use smsgate_core::{
    Client, CreditLedger, CreditLock, DlqJob, GatewayError, GatewayResult, IdempotencyGate,
    LockState, Message, MessageStatus, MessageStore, NewMessage, OutboundSms,
    ProviderSendOutcome, RateDecision, RateLimiter, SendJob, SmsProvider,
};

use crate::msg::JobPublisher;

pub fn test_client(id: Uuid) -> Client {
    Client {
        id,
        name: "test-client".into(),
        api_key_hash: "test-key".into(),
        dlr_callback_url: None,
        callback_hmac_secret: None,
        credit_cents: 0,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Message store

#[derive(Default)]
pub struct MemMessageStore {
    rows: Mutex<HashMap<Uuid, Message>>,
}

impl MemMessageStore {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub async fn seed_queued(&self, client_id: Uuid) -> Message {
        self.create(NewMessage {
            id: Uuid::new_v4(),
            client_id,
            to: "+15551230000".into(),
            from: "smsgate".into(),
            text: "hello".into(),
            parts: 1,
            client_reference: None,
            express: false,
        })
        .await
        .unwrap()
    }

    pub async fn seed_with_status(&self, client_id: Uuid, status: MessageStatus) -> Message {
        let msg = self.seed_queued(client_id).await;
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&msg.id).unwrap();
        row.status = status;
        row.clone()
    }

    pub async fn make_due(&self, id: Uuid) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            row.retry_after = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    pub fn set_provider_message_id(&self, id: Uuid, provider_message_id: &str) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            row.provider_message_id = Some(provider_message_id.to_string());
        }
    }

    pub fn age_updated_at(&self, id: Uuid, by: Duration) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            row.updated_at = Utc::now() - chrono::Duration::from_std(by).unwrap();
        }
    }

    pub fn age_created_at(&self, id: Uuid, by: Duration) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            row.created_at = Utc::now() - chrono::Duration::from_std(by).unwrap();
        }
    }
}

#[async_trait]
impl MessageStore for MemMessageStore {
    async fn create(&self, new: NewMessage) -> GatewayResult<Message> {
        let now = Utc::now();
        let message = Message {
            id: new.id,
            client_id: new.client_id,
            to: new.to,
            from: new.from,
            text: new.text,
            parts: new.parts,
            status: MessageStatus::Queued,
            client_reference: new.client_reference,
            provider: None,
            provider_message_id: None,
            attempts: 0,
            last_error: None,
            express: new.express,
            retry_after: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: Uuid) -> GatewayResult<Option<Message>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn get_for_client(
        &self,
        id: Uuid,
        client_id: Uuid,
    ) -> GatewayResult<Option<Message>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&id)
            .filter(|m| m.client_id == client_id)
            .cloned())
    }

    async fn list_for_client(
        &self,
        client_id: Uuid,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.client_id == client_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn get_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> GatewayResult<Option<Message>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> GatewayResult<()> {
        self.rows.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn claim(&self, id: Uuid) -> GatewayResult<Option<Message>> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.status.is_claimable() => {
                row.status = MessageStatus::Sending;
                row.attempts += 1;
                row.updated_at = Utc::now();
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_provider(&self, id: Uuid, provider: &str) -> GatewayResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            row.provider = Some(provider.to_string());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        provider_message_id: Option<&str>,
        last_error: Option<&str>,
    ) -> GatewayResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&id) else {
            return Err(GatewayError::NotFound("message"));
        };
        if row.status.is_terminal() && row.status != status {
            return Err(GatewayError::InvalidTransition {
                from: row.status,
                to: status,
            });
        }
        row.status = status;
        if let Some(pid) = provider_message_id {
            row.provider_message_id = Some(pid.to_string());
        }
        if let Some(err) = last_error {
            row.last_error = Some(err.to_string());
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_after: DateTime<Utc>,
        last_error: &str,
    ) -> GatewayResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            if matches!(row.status, MessageStatus::Sending | MessageStatus::Sent) {
                row.status = MessageStatus::FailedTemp;
                row.retry_after = Some(retry_after);
                row.last_error = Some(last_error.to_string());
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> GatewayResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            if row.status == MessageStatus::Sending {
                row.status = MessageStatus::Queued;
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|m| {
                m.status == MessageStatus::FailedTemp
                    && m.retry_after.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.updated_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn stale_queued(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.status == MessageStatus::Queued && m.created_at < older_than)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn stuck_sending(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.status == MessageStatus::Sending && m.updated_at < older_than)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.updated_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Credit ledger

struct LedgerState {
    balance_cents: i64,
    locks: HashMap<Uuid, (Uuid, i64, LockState)>,
}

pub struct MemCreditLedger {
    client_id: Uuid,
    state: Mutex<LedgerState>,
}

impl MemCreditLedger {
    pub fn with_balance(balance_cents: i64) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            state: Mutex::new(LedgerState {
                balance_cents,
                locks: HashMap::new(),
            }),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn balance(&self) -> i64 {
        self.state.lock().unwrap().balance_cents
    }

    pub fn lock_state(&self, message_id: Uuid) -> Option<LockState> {
        self.state
            .lock()
            .unwrap()
            .locks
            .get(&message_id)
            .map(|(_, _, state)| *state)
    }

    pub fn held_total(&self) -> i64 {
        self.state
            .lock()
            .unwrap()
            .locks
            .values()
            .filter(|(_, _, state)| *state == LockState::Held)
            .map(|(_, amount, _)| amount)
            .sum()
    }
}

#[async_trait]
impl CreditLedger for MemCreditLedger {
    async fn hold(
        &self,
        client_id: Uuid,
        message_id: Uuid,
        amount_cents: i64,
    ) -> GatewayResult<CreditLock> {
        let mut state = self.state.lock().unwrap();
        if let Some((_, amount, lock_state)) = state.locks.get(&message_id) {
            if *lock_state == LockState::Held && *amount == amount_cents {
                return Ok(mk_lock(client_id, message_id, amount_cents, LockState::Held));
            }
            return Err(GatewayError::LockConflict { message_id });
        }
        if state.balance_cents < amount_cents {
            return Err(GatewayError::InsufficientCredit {
                required_cents: amount_cents,
                available_cents: state.balance_cents,
            });
        }
        state.balance_cents -= amount_cents;
        state
            .locks
            .insert(message_id, (client_id, amount_cents, LockState::Held));
        Ok(mk_lock(client_id, message_id, amount_cents, LockState::Held))
    }

    async fn capture(&self, message_id: Uuid) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.locks.get_mut(&message_id) {
            Some((_, _, lock_state)) if *lock_state != LockState::Released => {
                *lock_state = LockState::Captured;
                Ok(())
            }
            _ => Err(GatewayError::LockNotHeld { message_id }),
        }
    }

    async fn release(&self, message_id: Uuid) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some((_, amount, lock_state)) = state.locks.get(&message_id).copied() else {
            return Err(GatewayError::LockNotHeld { message_id });
        };
        match lock_state {
            LockState::Released => Ok(()),
            LockState::Captured => Err(GatewayError::LockNotHeld { message_id }),
            LockState::Held => {
                state.balance_cents += amount;
                if let Some(entry) = state.locks.get_mut(&message_id) {
                    entry.2 = LockState::Released;
                }
                Ok(())
            }
        }
    }
}

fn mk_lock(client_id: Uuid, message_id: Uuid, amount_cents: i64, state: LockState) -> CreditLock {
    let now = Utc::now();
    CreditLock {
        id: Uuid::new_v4(),
        client_id,
        message_id,
        amount_cents,
        state,
        created_at: now,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// Idempotency gate and rate limiters

#[derive(Default)]
pub struct MemIdempotencyGate {
    entries: Mutex<HashMap<String, Uuid>>,
}

impl MemIdempotencyGate {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl IdempotencyGate for MemIdempotencyGate {
    async fn get(&self, client_id: Uuid, key: &str) -> GatewayResult<Option<Uuid>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&format!("{client_id}:{key}"))
            .copied())
    }

    async fn put(&self, client_id: Uuid, key: &str, message_id: Uuid) -> GatewayResult<()> {
        self.entries
            .lock()
            .unwrap()
            .entry(format!("{client_id}:{key}"))
            .or_insert(message_id);
        Ok(())
    }
}

pub struct AllowAllLimiter;

#[async_trait]
impl RateLimiter for AllowAllLimiter {
    async fn check(&self, _client_id: Uuid) -> GatewayResult<RateDecision> {
        Ok(RateDecision::Allowed)
    }
}

pub struct DenyAllLimiter {
    pub retry_after: u64,
}

#[async_trait]
impl RateLimiter for DenyAllLimiter {
    async fn check(&self, _client_id: Uuid) -> GatewayResult<RateDecision> {
        Ok(RateDecision::Limited {
            retry_after_seconds: self.retry_after,
        })
    }
}

// ---------------------------------------------------------------------------
// Job publisher

#[derive(Default)]
pub struct MemPublisher {
    fail: bool,
    send: Mutex<Vec<SendJob>>,
    dlq: Mutex<Vec<DlqJob>>,
}

impl MemPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn send_jobs(&self) -> Vec<SendJob> {
        self.send.lock().unwrap().clone()
    }

    pub fn dlq_jobs(&self) -> Vec<DlqJob> {
        self.dlq.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobPublisher for MemPublisher {
    async fn publish_send_job(&self, job: &SendJob) -> GatewayResult<()> {
        if self.fail {
            return Err(GatewayError::Broker("broker unavailable".into()));
        }
        self.send.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn publish_dlq(&self, job: &DlqJob) -> GatewayResult<()> {
        if self.fail {
            return Err(GatewayError::Broker("broker unavailable".into()));
        }
        self.dlq.lock().unwrap().push(job.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted provider

pub struct ScriptedProvider {
    outcomes: Mutex<VecDeque<ProviderSendOutcome>>,
}

impl ScriptedProvider {
    pub fn new(outcomes: Vec<ProviderSendOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }
}

#[async_trait]
impl SmsProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(
        &self,
        _sms: &OutboundSms,
        _deadline: Duration,
    ) -> GatewayResult<ProviderSendOutcome> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted provider ran out of outcomes");
        Ok(outcome)
    }
}
