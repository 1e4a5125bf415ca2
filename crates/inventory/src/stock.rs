use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nutrishop_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use nutrishop_events::Event;

/// Aggregate type tag used for stock streams.
pub const STOCK_AGGREGATE_TYPE: &str = "inventory.stock";

const SKU_MAX_LEN: usize = 64;

/// Stock-keeping unit: the unique product identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sku(String);

impl Sku {
    /// Validate and wrap a SKU code (surrounding whitespace is trimmed).
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, DomainError> {
        let code = raw.as_ref().trim();
        if code.is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if code.len() > SKU_MAX_LEN {
            return Err(DomainError::validation(format!(
                "sku longer than {SKU_MAX_LEN} characters"
            )));
        }
        if code.chars().any(char::is_whitespace) {
            return Err(DomainError::validation("sku cannot contain whitespace"));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stream id of this SKU's stock record.
    pub fn stream_id(&self) -> AggregateId {
        AggregateId::derived(STOCK_AGGREGATE_TYPE, self.0.as_bytes())
    }
}

impl core::fmt::Display for Sku {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for Sku {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Aggregate root: StockRecord.
///
/// `quantity_available` is unsigned, so the non-negative invariant is carried
/// by the type; `handle` rejects any decrement that would underflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockRecord {
    sku: Sku,
    name: String,
    quantity_available: u64,
    version: u64,
    created: bool,
}

impl StockRecord {
    /// Create an empty, not-yet-registered aggregate instance for rehydration.
    pub fn empty(sku: Sku) -> Self {
        Self {
            sku,
            name: String::new(),
            quantity_available: 0,
            version: 0,
            created: false,
        }
    }

    pub fn sku(&self) -> &Sku {
        &self.sku
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quantity_available(&self) -> u64 {
        self.quantity_available
    }

    pub fn is_registered(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for StockRecord {
    type Id = Sku;

    fn id(&self) -> &Self::Id {
        &self.sku
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterSku (catalog ingestion).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSku {
    pub sku: Sku,
    pub name: String,
    pub initial_quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub sku: Sku,
    pub quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStock {
    pub sku: Sku,
    pub quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Restock (new inventory received).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restock {
    pub sku: Sku,
    pub quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    RegisterSku(RegisterSku),
    ReserveStock(ReserveStock),
    ReleaseStock(ReleaseStock),
    Restock(Restock),
}

/// Event: SkuRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuRegistered {
    pub sku: Sku,
    pub name: String,
    pub initial_quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub sku: Sku,
    pub quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub sku: Sku,
    pub quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockRestocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRestocked {
    pub sku: Sku,
    pub quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    SkuRegistered(SkuRegistered),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
    StockRestocked(StockRestocked),
}

impl StockEvent {
    pub fn sku(&self) -> &Sku {
        match self {
            StockEvent::SkuRegistered(e) => &e.sku,
            StockEvent::StockReserved(e) => &e.sku,
            StockEvent::StockReleased(e) => &e.sku,
            StockEvent::StockRestocked(e) => &e.sku,
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::SkuRegistered(_) => "inventory.stock.registered",
            StockEvent::StockReserved(_) => "inventory.stock.reserved",
            StockEvent::StockReleased(_) => "inventory.stock.released",
            StockEvent::StockRestocked(_) => "inventory.stock.restocked",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::SkuRegistered(e) => e.occurred_at,
            StockEvent::StockReserved(e) => e.occurred_at,
            StockEvent::StockReleased(e) => e.occurred_at,
            StockEvent::StockRestocked(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockRecord {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::SkuRegistered(e) => {
                self.sku = e.sku.clone();
                self.name = e.name.clone();
                self.quantity_available = e.initial_quantity;
                self.created = true;
            }
            StockEvent::StockReserved(e) => {
                self.quantity_available = self.quantity_available.saturating_sub(e.quantity);
            }
            StockEvent::StockReleased(e) => {
                self.quantity_available = self.quantity_available.saturating_add(e.quantity);
            }
            StockEvent::StockRestocked(e) => {
                self.quantity_available = self.quantity_available.saturating_add(e.quantity);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::RegisterSku(cmd) => self.handle_register(cmd),
            StockCommand::ReserveStock(cmd) => self.handle_reserve(cmd),
            StockCommand::ReleaseStock(cmd) => self.handle_release(cmd),
            StockCommand::Restock(cmd) => self.handle_restock(cmd),
        }
    }
}

impl StockRecord {
    fn ensure_sku(&self, sku: &Sku) -> Result<(), DomainError> {
        if &self.sku != sku {
            return Err(DomainError::invariant("sku mismatch"));
        }
        Ok(())
    }

    fn ensure_registered(&self, sku: &Sku) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_sku(sku)
    }

    fn handle_register(&self, cmd: &RegisterSku) -> Result<Vec<StockEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(format!("sku {} already registered", cmd.sku)));
        }
        self.ensure_sku(&cmd.sku)?;
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        Ok(vec![StockEvent::SkuRegistered(SkuRegistered {
            sku: cmd.sku.clone(),
            name: cmd.name.trim().to_string(),
            initial_quantity: cmd.initial_quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &ReserveStock) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(&cmd.sku)?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.quantity > self.quantity_available {
            return Err(DomainError::insufficient_stock(
                cmd.quantity,
                self.quantity_available,
            ));
        }
        Ok(vec![StockEvent::StockReserved(StockReserved {
            sku: cmd.sku.clone(),
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseStock) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(&cmd.sku)?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if self.quantity_available.checked_add(cmd.quantity).is_none() {
            return Err(DomainError::invariant("stock counter overflow"));
        }
        Ok(vec![StockEvent::StockReleased(StockReleased {
            sku: cmd.sku.clone(),
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_restock(&self, cmd: &Restock) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(&cmd.sku)?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if self.quantity_available.checked_add(cmd.quantity).is_none() {
            return Err(DomainError::invariant("stock counter overflow"));
        }
        Ok(vec![StockEvent::StockRestocked(StockRestocked {
            sku: cmd.sku.clone(),
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}
