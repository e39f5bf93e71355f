//! Banking domain shared by the integration tests: accounts, transfers, a
//! transfer process manager and a welcome-bonus process manager.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use eventfold_dispatch::{
    Aggregate, CommandEnvelope, CommandMessage, DispatchReceipt, Dispatcher, InMemoryEventStore,
    Observer, ProcessManager, ProcessManagerRuntime, RecordedEvent, RuntimeReport,
};
use serde::{Deserialize, Serialize};

// --- Account ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub opened: bool,
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountCommand {
    OpenAccount {
        account_id: String,
        initial_balance: u64,
    },
    DepositMoney {
        account_id: String,
        amount: u64,
        transfer_id: Option<String>,
    },
    WithdrawMoney {
        account_id: String,
        amount: u64,
        transfer_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    AccountOpened {
        account_id: String,
        initial_balance: u64,
    },
    MoneyDeposited {
        account_id: String,
        amount: u64,
        transfer_id: Option<String>,
    },
    MoneyWithdrawn {
        account_id: String,
        amount: u64,
        transfer_id: Option<String>,
    },
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum AccountError {
    #[error("account is already open")]
    AlreadyOpen,
    #[error("account is not open")]
    NotOpen,
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";

    type Command = AccountCommand;
    type DomainEvent = AccountEvent;
    type Error = AccountError;

    fn instance_id(cmd: &Self::Command) -> String {
        match cmd {
            AccountCommand::OpenAccount { account_id, .. }
            | AccountCommand::DepositMoney { account_id, .. }
            | AccountCommand::WithdrawMoney { account_id, .. } => account_id.clone(),
        }
    }

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
        match cmd {
            AccountCommand::OpenAccount {
                account_id,
                initial_balance,
            } => {
                if self.opened {
                    return Err(AccountError::AlreadyOpen);
                }
                Ok(vec![AccountEvent::AccountOpened {
                    account_id,
                    initial_balance,
                }])
            }
            AccountCommand::DepositMoney {
                account_id,
                amount,
                transfer_id,
            } => {
                if !self.opened {
                    return Err(AccountError::NotOpen);
                }
                Ok(vec![AccountEvent::MoneyDeposited {
                    account_id,
                    amount,
                    transfer_id,
                }])
            }
            AccountCommand::WithdrawMoney {
                account_id,
                amount,
                transfer_id,
            } => {
                if !self.opened {
                    return Err(AccountError::NotOpen);
                }
                if amount > self.balance {
                    return Err(AccountError::InsufficientFunds {
                        balance: self.balance,
                        requested: amount,
                    });
                }
                Ok(vec![AccountEvent::MoneyWithdrawn {
                    account_id,
                    amount,
                    transfer_id,
                }])
            }
        }
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        match event {
            AccountEvent::AccountOpened {
                initial_balance, ..
            } => {
                self.opened = true;
                self.balance = *initial_balance;
            }
            AccountEvent::MoneyDeposited { amount, .. } => self.balance += amount,
            AccountEvent::MoneyWithdrawn { amount, .. } => self.balance -= amount,
        }
        self
    }
}

pub fn open_account(account_id: &str, initial_balance: u64) -> AccountCommand {
    AccountCommand::OpenAccount {
        account_id: account_id.into(),
        initial_balance,
    }
}

pub fn deposit(account_id: &str, amount: u64) -> AccountCommand {
    AccountCommand::DepositMoney {
        account_id: account_id.into(),
        amount,
        transfer_id: None,
    }
}

// --- Transfer ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub requested: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransferCommand {
    TransferMoney {
        transfer_id: String,
        from: String,
        to: String,
        amount: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransferEvent {
    TransferRequested {
        transfer_id: String,
        from: String,
        to: String,
        amount: u64,
    },
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer already requested")]
    AlreadyRequested,
    #[error("transfer amount must be positive")]
    ZeroAmount,
}

impl Aggregate for Transfer {
    const AGGREGATE_TYPE: &'static str = "transfer";

    type Command = TransferCommand;
    type DomainEvent = TransferEvent;
    type Error = TransferError;

    fn instance_id(cmd: &Self::Command) -> String {
        match cmd {
            TransferCommand::TransferMoney { transfer_id, .. } => transfer_id.clone(),
        }
    }

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
        match cmd {
            TransferCommand::TransferMoney {
                transfer_id,
                from,
                to,
                amount,
            } => {
                if self.requested {
                    return Err(TransferError::AlreadyRequested);
                }
                if amount == 0 {
                    return Err(TransferError::ZeroAmount);
                }
                Ok(vec![TransferEvent::TransferRequested {
                    transfer_id,
                    from,
                    to,
                    amount,
                }])
            }
        }
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        match event {
            TransferEvent::TransferRequested { .. } => self.requested = true,
        }
        self
    }
}

pub fn transfer(transfer_id: &str, from: &str, to: &str, amount: u64) -> TransferCommand {
    TransferCommand::TransferMoney {
        transfer_id: transfer_id.into(),
        from: from.into(),
        to: to.into(),
        amount,
    }
}

// --- Process managers ---

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct WorkflowError(pub String);

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        WorkflowError(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStage {
    #[default]
    New,
    Requested,
    Withdrawn,
    Completed,
}

/// Moves money for a requested transfer: withdraw from the source, then
/// deposit into the destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    pub transfer_id: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub stage: TransferStage,
}

impl ProcessManager for TransferProcess {
    const NAME: &'static str = "transfer-process";
    const EVENT_TYPES: &'static [&'static str] =
        &["TransferRequested", "MoneyWithdrawn", "MoneyDeposited"];

    type Error = WorkflowError;

    fn identify(event: &RecordedEvent) -> Option<String> {
        if event.event_type == "TransferRequested" {
            let TransferEvent::TransferRequested { transfer_id, .. } = event.decode().ok()?;
            return Some(transfer_id);
        }
        match event.decode::<AccountEvent>().ok()? {
            AccountEvent::MoneyWithdrawn { transfer_id, .. }
            | AccountEvent::MoneyDeposited { transfer_id, .. } => transfer_id,
            AccountEvent::AccountOpened { .. } => None,
        }
    }

    fn evolve(mut self, event: &RecordedEvent) -> Result<Self, Self::Error> {
        match event.event_type.as_str() {
            "TransferRequested" => {
                let TransferEvent::TransferRequested {
                    transfer_id,
                    from,
                    to,
                    amount,
                } = event.decode()?;
                self.transfer_id = transfer_id;
                self.from = from;
                self.to = to;
                self.amount = amount;
                self.stage = TransferStage::Requested;
            }
            "MoneyWithdrawn" => self.stage = TransferStage::Withdrawn,
            "MoneyDeposited" => self.stage = TransferStage::Completed,
            _ => {}
        }
        Ok(self)
    }

    fn react(&self, event: &RecordedEvent) -> Result<Vec<CommandEnvelope>, Self::Error> {
        let command = match event.event_type.as_str() {
            "TransferRequested" => AccountCommand::WithdrawMoney {
                account_id: self.from.clone(),
                amount: self.amount,
                transfer_id: Some(self.transfer_id.clone()),
            },
            "MoneyWithdrawn" => AccountCommand::DepositMoney {
                account_id: self.to.clone(),
                amount: self.amount,
                transfer_id: Some(self.transfer_id.clone()),
            },
            _ => return Ok(Vec::new()),
        };
        Ok(vec![CommandEnvelope::to::<Account>(&command)?])
    }

    fn is_complete(&self) -> bool {
        self.stage == TransferStage::Completed
    }
}

pub const WELCOME_BONUS: u64 = 10;

/// Credits every newly opened account once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WelcomeBonus {
    pub account_id: Option<String>,
}

impl ProcessManager for WelcomeBonus {
    const NAME: &'static str = "welcome-bonus";
    const EVENT_TYPES: &'static [&'static str] = &["AccountOpened"];

    type Error = WorkflowError;

    fn identify(event: &RecordedEvent) -> Option<String> {
        match event.decode::<AccountEvent>().ok()? {
            AccountEvent::AccountOpened { account_id, .. } => Some(account_id),
            _ => None,
        }
    }

    fn evolve(mut self, event: &RecordedEvent) -> Result<Self, Self::Error> {
        if let AccountEvent::AccountOpened { account_id, .. } = event.decode()? {
            self.account_id = Some(account_id);
        }
        Ok(self)
    }

    fn react(&self, _event: &RecordedEvent) -> Result<Vec<CommandEnvelope>, Self::Error> {
        let Some(account_id) = &self.account_id else {
            return Ok(Vec::new());
        };
        Ok(vec![CommandEnvelope::to::<Account>(&deposit(
            account_id,
            WELCOME_BONUS,
        ))?])
    }

    fn is_complete(&self) -> bool {
        self.account_id.is_some()
    }
}

// --- Instrumentation ---

/// Records every lifecycle notification.
#[derive(Default)]
pub struct RecordingObserver {
    pub dispatched: Mutex<Vec<CommandMessage>>,
    pub appended: Mutex<Vec<DispatchReceipt>>,
    pub acknowledged: Mutex<Vec<(String, RecordedEvent)>>,
}

impl Observer for RecordingObserver {
    fn before_dispatch(&self, msg: &CommandMessage) {
        self.dispatched.lock().unwrap().push(msg.clone());
    }

    fn after_append(&self, receipt: &DispatchReceipt) {
        self.appended.lock().unwrap().push(receipt.clone());
    }

    fn before_acknowledge(&self, process_manager: &str, event: &RecordedEvent) {
        self.acknowledged
            .lock()
            .unwrap()
            .push((process_manager.to_string(), event.clone()));
    }
}

impl RecordingObserver {
    /// The dispatched command whose ID is `command_id`.
    pub fn command(&self, command_id: uuid::Uuid) -> CommandMessage {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.command_id == command_id)
            .cloned()
            .expect("command was dispatched")
    }
}

pub fn bank(store: &InMemoryEventStore, observer: Arc<RecordingObserver>) -> Dispatcher {
    Dispatcher::builder(Arc::new(store.clone()))
        .aggregate::<Account>()
        .aggregate::<Transfer>()
        .observer(observer)
        .build()
}

/// Run passes until a pass appends nothing new. Returns the summed report.
pub async fn run_until_idle(
    runtime: &ProcessManagerRuntime,
    store: &InMemoryEventStore,
) -> RuntimeReport {
    let mut total = RuntimeReport::default();
    for _ in 0..20 {
        let before = store.last_position().await;
        let report = runtime.run_once().await.expect("runtime pass failed");
        for (name, pm) in report.process_managers {
            total.process_managers.entry(name).or_default().merge(&pm);
        }
        if store.last_position().await == before {
            return total;
        }
    }
    panic!("process managers did not go idle");
}

/// Event at global position `position`.
pub async fn event_at(store: &InMemoryEventStore, position: u64) -> RecordedEvent {
    store.all_events().await[position as usize - 1].clone()
}

/// Events of `event_type`, in global order.
pub async fn events_of(store: &InMemoryEventStore, event_type: &str) -> Vec<RecordedEvent> {
    store
        .all_events()
        .await
        .into_iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}
