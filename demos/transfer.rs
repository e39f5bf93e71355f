//! Self-contained example: a money transfer driven by a process manager.
//!
//! Opens two accounts, requests a transfer, and lets the
//! `TransferProcess` withdraw from the source and deposit into the
//! destination. Every command and event of the transfer shares one
//! correlation ID.
//!
//! Run with: `RUST_LOG=eventfold_dispatch=debug cargo run --example transfer`

use std::sync::Arc;

use eventfold_dispatch::{
    Aggregate, CommandContext, CommandEnvelope, Dispatcher, FileCheckpointStore,
    InMemoryEventStore, ProcessManager, ProcessManagerRuntime, RecordedEvent, TracingMiddleware,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Account aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    opened: bool,
    balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountCommand {
    Open { account_id: String, balance: u64 },
    Withdraw { account_id: String, amount: u64, transfer_id: String },
    Deposit { account_id: String, amount: u64, transfer_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    Opened { account_id: String, balance: u64 },
    Withdrawn { account_id: String, amount: u64, transfer_id: String },
    Deposited { account_id: String, amount: u64, transfer_id: String },
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("account is not open")]
    NotOpen,
    #[error("insufficient funds")]
    InsufficientFunds,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";
    type Command = AccountCommand;
    type DomainEvent = AccountEvent;
    type Error = AccountError;

    fn instance_id(cmd: &AccountCommand) -> String {
        match cmd {
            AccountCommand::Open { account_id, .. }
            | AccountCommand::Withdraw { account_id, .. }
            | AccountCommand::Deposit { account_id, .. } => account_id.clone(),
        }
    }

    fn handle(&self, cmd: AccountCommand) -> Result<Vec<AccountEvent>, AccountError> {
        match cmd {
            AccountCommand::Open { account_id, balance } => {
                Ok(vec![AccountEvent::Opened { account_id, balance }])
            }
            AccountCommand::Withdraw {
                account_id,
                amount,
                transfer_id,
            } => {
                if !self.opened {
                    return Err(AccountError::NotOpen);
                }
                if amount > self.balance {
                    return Err(AccountError::InsufficientFunds);
                }
                Ok(vec![AccountEvent::Withdrawn {
                    account_id,
                    amount,
                    transfer_id,
                }])
            }
            AccountCommand::Deposit {
                account_id,
                amount,
                transfer_id,
            } => {
                if !self.opened {
                    return Err(AccountError::NotOpen);
                }
                Ok(vec![AccountEvent::Deposited {
                    account_id,
                    amount,
                    transfer_id,
                }])
            }
        }
    }

    fn apply(mut self, event: &AccountEvent) -> Self {
        match event {
            AccountEvent::Opened { balance, .. } => {
                self.opened = true;
                self.balance = *balance;
            }
            AccountEvent::Withdrawn { amount, .. } => self.balance -= amount,
            AccountEvent::Deposited { amount, .. } => self.balance += amount,
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Transfer aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Transfer;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum TransferCommand {
    Request {
        transfer_id: String,
        from: String,
        to: String,
        amount: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum TransferEvent {
    Requested {
        transfer_id: String,
        from: String,
        to: String,
        amount: u64,
    },
}

impl Aggregate for Transfer {
    const AGGREGATE_TYPE: &'static str = "transfer";
    type Command = TransferCommand;
    type DomainEvent = TransferEvent;
    type Error = std::convert::Infallible;

    fn instance_id(cmd: &TransferCommand) -> String {
        let TransferCommand::Request { transfer_id, .. } = cmd;
        transfer_id.clone()
    }

    fn handle(&self, cmd: TransferCommand) -> Result<Vec<TransferEvent>, Self::Error> {
        let TransferCommand::Request {
            transfer_id,
            from,
            to,
            amount,
        } = cmd;
        Ok(vec![TransferEvent::Requested {
            transfer_id,
            from,
            to,
            amount,
        }])
    }

    fn apply(self, _event: &TransferEvent) -> Self {
        self
    }
}

// ---------------------------------------------------------------------------
// Transfer process manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TransferProcess {
    from: String,
    to: String,
    amount: u64,
    deposited: bool,
}

impl TransferProcess {
    fn transfer_id(event: &RecordedEvent) -> Option<String> {
        event.payload["transfer_id"].as_str().map(str::to_string)
    }
}

impl ProcessManager for TransferProcess {
    const NAME: &'static str = "transfer";
    const EVENT_TYPES: &'static [&'static str] = &["Requested", "Withdrawn", "Deposited"];
    type Error = serde_json::Error;

    fn identify(event: &RecordedEvent) -> Option<String> {
        Self::transfer_id(event)
    }

    fn evolve(mut self, event: &RecordedEvent) -> Result<Self, Self::Error> {
        match event.event_type.as_str() {
            "Requested" => {
                let TransferEvent::Requested {
                    from, to, amount, ..
                } = event.decode()?;
                self.from = from;
                self.to = to;
                self.amount = amount;
            }
            "Deposited" => self.deposited = true,
            _ => {}
        }
        Ok(self)
    }

    fn react(&self, event: &RecordedEvent) -> Result<Vec<CommandEnvelope>, Self::Error> {
        let Some(transfer_id) = Self::transfer_id(event) else {
            return Ok(Vec::new());
        };
        let command = match event.event_type.as_str() {
            "Requested" => AccountCommand::Withdraw {
                account_id: self.from.clone(),
                amount: self.amount,
                transfer_id,
            },
            "Withdrawn" => AccountCommand::Deposit {
                account_id: self.to.clone(),
                amount: self.amount,
                transfer_id,
            },
            _ => return Ok(Vec::new()),
        };
        Ok(vec![CommandEnvelope::to::<Account>(&command)?])
    }

    fn is_complete(&self) -> bool {
        self.deposited
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("eventfold_dispatch=info".parse()?),
        )
        .init();

    // Checkpoints live in a temporary directory.
    let tmp = tempfile::tempdir()?;

    let store = InMemoryEventStore::new();
    let dispatcher = Dispatcher::builder(Arc::new(store.clone()))
        .aggregate::<Account>()
        .aggregate::<Transfer>()
        .middleware(TracingMiddleware)
        .build();
    let runtime = ProcessManagerRuntime::builder(
        dispatcher.clone(),
        Arc::new(FileCheckpointStore::new(tmp.path())),
    )
    .process_manager::<TransferProcess>()
    .build();

    let ctx = CommandContext::default().with_actor("example-runner");
    for (account_id, balance) in [("alice", 500), ("bob", 0)] {
        dispatcher
            .dispatch::<Account>(
                AccountCommand::Open {
                    account_id: account_id.into(),
                    balance,
                },
                ctx.clone(),
            )
            .await?;
    }
    let receipt = dispatcher
        .dispatch::<Transfer>(
            TransferCommand::Request {
                transfer_id: "t-1".into(),
                from: "alice".into(),
                to: "bob".into(),
                amount: 120,
            },
            ctx,
        )
        .await?;

    // Each pass reacts to the events the previous one produced.
    loop {
        let before = store.last_position().await;
        let report = runtime.run_once().await?;
        let total = report.total();
        println!(
            "pass: delivered={}, dispatched={}, completed={}",
            total.delivered, total.dispatched, total.completed
        );
        if store.last_position().await == before {
            break;
        }
    }

    let alice = dispatcher.load::<Account>("alice").await?.state;
    let bob = dispatcher.load::<Account>("bob").await?.state;
    println!("alice = {}", alice.balance);
    println!("bob   = {}", bob.balance);

    for event in store.all_events().await {
        println!(
            "{:>2} {:<10} {:<14} correlation={}",
            event.global_position,
            event.event_type,
            event.stream_id,
            event.correlation_id()
        );
        if event.stream_id != "account/alice" && event.stream_id != "account/bob" {
            continue;
        }
        if event.event_type != "Opened" {
            assert_eq!(event.correlation_id(), receipt.correlation_id);
        }
    }

    assert_eq!(alice.balance, 380);
    assert_eq!(bob.balance, 120);
    println!("all assertions passed");

    Ok(())
}
