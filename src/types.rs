//! Core stock, identity and update-event types
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use minicbor::{Decode, Encode};

use crate::error::SyncResult;
use crate::utils::new_uuid_to_bech32;

/// Units on hand for one item. Never negative.
pub type StockQuantity = u64;

/// Ordering token of a committed state write. Strictly increasing across the
/// writes of one store, assigned inside the write itself.
pub type Revision = u64;

/// Clamps a requested quantity to the non-negative range.
pub fn clamp_quantity(requested: i64) -> StockQuantity {
    StockQuantity::try_from(requested).unwrap_or(0)
}

/// Revision for the write that follows `previous`. Tracks wall-clock
/// nanoseconds so revisions keep growing after the state record is removed.
pub fn next_revision(previous: Revision) -> Revision {
    let now = Revision::try_from(TimeStamp::new().as_nanos()).unwrap_or(0);
    previous.saturating_add(1).max(now)
}

/// Applies a signed delta to a quantity, saturating at zero.
pub fn apply_delta(current: StockQuantity, delta: i64) -> StockQuantity {
    if delta >= 0 {
        current.saturating_add(delta.unsigned_abs())
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId(value.to_owned())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        ItemId(value)
    }
}

impl Borrow<str> for ItemId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one execution context, bech32m encoded (`ctx1...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    pub fn generate() -> SyncResult<Self> {
        Ok(Self(new_uuid_to_bech32("ctx")?))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContextId {
    fn from(value: &str) -> Self {
        ContextId(value.to_owned())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn from_nanos(nanos: i64) -> Self {
        Self(DateTime::from_timestamp_nanos(nanos))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Nanoseconds since the epoch, saturating for dates outside ~1677..2262.
    pub fn as_nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

/// Full mapping from item to stock quantity; the unit of every store write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockState(BTreeMap<ItemId, StockQuantity>);

impl StockState {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, item_id: &str) -> Option<StockQuantity> {
        self.0.get(item_id).copied()
    }
    pub fn insert(&mut self, item_id: ItemId, quantity: StockQuantity) -> Option<StockQuantity> {
        self.0.insert(item_id, quantity)
    }
    pub fn contains(&self, item_id: &str) -> bool {
        self.0.contains_key(item_id)
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&ItemId, StockQuantity)> {
        self.0.iter().map(|(id, qty)| (id, *qty))
    }
    pub fn into_inner(self) -> BTreeMap<ItemId, StockQuantity> {
        self.0
    }
}

impl From<BTreeMap<ItemId, StockQuantity>> for StockState {
    fn from(value: BTreeMap<ItemId, StockQuantity>) -> Self {
        StockState(value)
    }
}

impl<K: Into<ItemId>> FromIterator<(K, StockQuantity)> for StockState {
    fn from_iter<I: IntoIterator<Item = (K, StockQuantity)>>(iter: I) -> Self {
        StockState(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum UpdateTarget {
    #[n(0)]
    Item {
        #[n(0)]
        item_id: ItemId,
        #[n(1)]
        quantity: StockQuantity,
        #[n(2)]
        revision: Revision,
    },
    // full invalidation, re-read the whole state
    #[n(1)]
    All,
}

/// One change notification. Transient, never persisted beyond delivery.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct UpdateEvent {
    #[n(0)]
    pub target: UpdateTarget,
    #[n(1)]
    pub emitted_at: TimeStamp,
}

impl UpdateEvent {
    pub fn item(item_id: ItemId, quantity: StockQuantity, revision: Revision) -> Self {
        Self {
            target: UpdateTarget::Item {
                item_id,
                quantity,
                revision,
            },
            emitted_at: TimeStamp::new(),
        }
    }
    pub fn all() -> Self {
        Self {
            target: UpdateTarget::All,
            emitted_at: TimeStamp::new(),
        }
    }
    pub fn item_id(&self) -> Option<&ItemId> {
        match &self.target {
            UpdateTarget::Item { item_id, .. } => Some(item_id),
            UpdateTarget::All => None,
        }
    }
    pub fn quantity(&self) -> Option<StockQuantity> {
        match &self.target {
            UpdateTarget::Item { quantity, .. } => Some(*quantity),
            UpdateTarget::All => None,
        }
    }
    pub fn revision(&self) -> Option<Revision> {
        match &self.target {
            UpdateTarget::Item { revision, .. } => Some(*revision),
            UpdateTarget::All => None,
        }
    }
    pub fn is_full_invalidation(&self) -> bool {
        self.target == UpdateTarget::All
    }
}

/// Coarse stock classification shown next to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockLevel {
    OutOfStock,
    Low,
    Medium,
    High,
}

impl StockLevel {
    pub fn of(quantity: StockQuantity) -> Self {
        match quantity {
            0 => StockLevel::OutOfStock,
            1..=4 => StockLevel::Low,
            5..=19 => StockLevel::Medium,
            _ => StockLevel::High,
        }
    }
    pub fn label(quantity: StockQuantity) -> String {
        match Self::of(quantity) {
            StockLevel::OutOfStock => "Out of Stock".to_string(),
            StockLevel::Low => format!("Low Stock ({quantity} left)"),
            StockLevel::Medium | StockLevel::High => format!("In Stock ({quantity} available)"),
        }
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl<C> minicbor::Encode<C> for ItemId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for ItemId {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(ItemId(d.str()?.to_owned()))
    }
}

impl<C> minicbor::Encode<C> for ContextId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for ContextId {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(ContextId(d.str()?.to_owned()))
    }
}

impl<C> minicbor::Encode<C> for StockState {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        self.0.encode(e, ctx)
    }
}

impl<'b, C> minicbor::Decode<'b, C> for StockState {
    fn decode(d: &mut minicbor::Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(StockState(BTreeMap::decode(d, ctx)?))
    }
}
