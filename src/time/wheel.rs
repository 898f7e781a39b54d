//! Hierarchical timing wheel for alarm management.
//!
//! Alarm times are scaled to *keys* by dropping the low `log2(alarm_precision)`
//! bits. The wheel is a stack of levels; level `i` has `2^bits[i]` slots, each
//! slot covering `2^shift[i]` keys, where `shift[i]` is the sum of the bits of
//! the levels below. An alarm sits in the lowest level whose window ahead of
//! `now` can represent it. Alarms whose key equals the key of `now` are kept in
//! a separate *current interval* list.
//!
//! Two ways of firing alarms are provided:
//!
//! - [`TimingWheel::advance_clock`] is approximate: it fires every alarm whose
//!   key interval lies wholly before the new `now`, so alarms in the interval
//!   containing `now` stay in the wheel even when their time has passed.
//! - [`TimingWheel::fire_past_alarms`] is exact: it fires the alarms of the
//!   current interval whose time is at or before `now`.
//!
//! Calling both gives exact firing. Within one call alarms fire in
//! non-decreasing time order, ties broken by insertion order.
//!
//! # Performance Characteristics
//!
//! - Add: O(levels)
//! - Remove: O(slot length)
//! - Advance: O(slots crossed + alarms moved or fired)
//! - Next alarm lookup: O(slots) in the worst case

use super::Time;

use slab::Slab;
use std::mem;
use std::time::Duration;

const DEFAULT_PRECISION_NANOS: u64 = 1 << 20;
const DEFAULT_LEVEL_BITS: [u32; 5] = [11, 10, 10, 10, 3];
const MAX_BITS_PER_LEVEL: u32 = 30;

/// Errors reported by the timing wheel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WheelError {
    #[error("alarm time {at} is before the wheel's current time {now}")]
    AlarmInPast { at: Time, now: Time },

    #[error("alarm time {at} exceeds the max allowed alarm time {max}")]
    AlarmTooFar { at: Time, max: Time },

    #[error("invalid timing wheel config: {0}")]
    InvalidConfig(String),
}

/// Shape of a [`TimingWheel`].
///
/// `alarm_precision` is rounded down to a power of two nanoseconds. The
/// default is 2^20 ns (about 1.05 ms) with level bits `[11, 10, 10, 10, 3]`,
/// which together cover every representable [`Time`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelConfig {
    alarm_precision: Duration,
    level_bits: Vec<u32>,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            alarm_precision: Duration::from_nanos(DEFAULT_PRECISION_NANOS),
            level_bits: DEFAULT_LEVEL_BITS.to_vec(),
        }
    }
}

impl WheelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the alarm precision.
    pub fn alarm_precision(mut self, precision: Duration) -> Self {
        self.alarm_precision = precision;
        self
    }

    /// Sets the number of bits of each level, lowest level first.
    pub fn level_bits(mut self, bits: impl Into<Vec<u32>>) -> Self {
        self.level_bits = bits.into();
        self
    }

    /// Returns the effective precision, rounded down to a power of two.
    pub fn precision(&self) -> Duration {
        Duration::from_nanos(1u64 << self.precision_bits())
    }

    /// Checks that the configuration describes a usable wheel.
    pub fn validate(&self) -> Result<(), WheelError> {
        if self.alarm_precision.is_zero() {
            return Err(WheelError::InvalidConfig(
                "alarm_precision must be positive".to_string(),
            ));
        }

        if self.level_bits.is_empty() {
            return Err(WheelError::InvalidConfig(
                "at least one level is required".to_string(),
            ));
        }

        if let Some(bits) = self
            .level_bits
            .iter()
            .find(|bits| **bits == 0 || **bits > MAX_BITS_PER_LEVEL)
        {
            return Err(WheelError::InvalidConfig(format!(
                "level bits must be in 1..={MAX_BITS_PER_LEVEL}, got {bits}"
            )));
        }

        let total: u32 = self.level_bits.iter().sum();
        if total + self.precision_bits() > 64 {
            return Err(WheelError::InvalidConfig(format!(
                "{total} level bits plus {} precision bits exceed 64",
                self.precision_bits()
            )));
        }

        Ok(())
    }

    fn precision_bits(&self) -> u32 {
        let nanos = u64::try_from(self.alarm_precision.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);

        63 - nanos.leading_zeros()
    }
}

/// Handle on an alarm stored in a [`TimingWheel`].
///
/// Handles stay valid until the alarm fires or is removed; afterwards every
/// operation treats them as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alarm {
    index: usize,
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Current,
    Level { level: usize, slot: usize },
}

struct Entry<V> {
    at: Time,
    key: u64,
    id: u64,
    location: Location,
    value: V,
}

struct Level {
    bits: u32,
    shift: u32,
    slots: Vec<Vec<usize>>,
}

impl Level {
    fn slot_count(&self) -> u64 {
        1u64 << self.bits
    }

    fn mask(&self) -> u64 {
        self.slot_count() - 1
    }
}

/// Hierarchical timing wheel mapping alarm times to values.
pub struct TimingWheel<V> {
    precision_bits: u32,
    now: Time,
    now_key: u64,
    levels: Vec<Level>,
    current: Vec<usize>,
    entries: Slab<Entry<V>>,
    next_id: u64,
}

impl<V> TimingWheel<V> {
    /// Creates an empty wheel whose clock starts at `start`.
    pub fn new(config: WheelConfig, start: Time) -> Result<Self, WheelError> {
        config.validate()?;

        let precision_bits = config.precision_bits();
        let mut shift = 0;
        let levels = config
            .level_bits
            .iter()
            .map(|&bits| {
                let level = Level {
                    bits,
                    shift,
                    slots: (0..1usize << bits).map(|_| Vec::new()).collect(),
                };
                shift += bits;
                level
            })
            .collect();

        Ok(Self {
            precision_bits,
            now: start,
            now_key: start.as_nanos() >> precision_bits,
            levels,
            current: Vec::new(),
            entries: Slab::new(),
            next_id: 0,
        })
    }

    /// Returns the wheel's notion of now.
    pub fn now(&self) -> Time {
        self.now
    }

    /// Returns the effective alarm precision.
    pub fn alarm_precision(&self) -> Duration {
        Duration::from_nanos(1u64 << self.precision_bits)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the latest time an alarm can currently be added at.
    pub fn max_allowed_alarm_time(&self) -> Time {
        let Some(top) = self.levels.last() else {
            return self.now;
        };

        let key_bits = 64 - self.precision_bits;
        if top.shift + top.bits >= key_bits {
            return Time::MAX;
        }

        let max_key =
            ((u128::from(self.now_key >> top.shift) + u128::from(top.slot_count())) << top.shift)
                - 1;
        let low_bits = (1u128 << self.precision_bits) - 1;
        let nanos = (max_key << self.precision_bits) | low_bits;

        Time::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Adds an alarm firing at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`WheelError::AlarmInPast`] when `at` is before [`now`](Self::now)
    /// and [`WheelError::AlarmTooFar`] when it is after
    /// [`max_allowed_alarm_time`](Self::max_allowed_alarm_time).
    pub fn add(&mut self, at: Time, value: V) -> Result<Alarm, WheelError> {
        if at < self.now {
            return Err(WheelError::AlarmInPast { at, now: self.now });
        }

        let max = self.max_allowed_alarm_time();
        if at > max {
            return Err(WheelError::AlarmTooFar { at, max });
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let index = self.entries.insert(Entry {
            at,
            key: self.key_of(at),
            id,
            location: Location::Current,
            value,
        });
        self.place(index);

        Ok(Alarm { index, id })
    }

    /// Returns `true` if the alarm is still waiting in the wheel.
    pub fn mem(&self, alarm: &Alarm) -> bool {
        self.entries
            .get(alarm.index)
            .is_some_and(|entry| entry.id == alarm.id)
    }

    /// Returns the time the alarm was scheduled for, if it is still pending.
    pub fn alarm_at(&self, alarm: &Alarm) -> Option<Time> {
        self.mem(alarm).then(|| self.entries[alarm.index].at)
    }

    /// Removes a pending alarm and returns its value.
    pub fn remove(&mut self, alarm: &Alarm) -> Option<V> {
        if !self.mem(alarm) {
            return None;
        }

        let entry = self.entries.remove(alarm.index);
        let bucket = match entry.location {
            Location::Current => &mut self.current,
            Location::Level { level, slot } => &mut self.levels[level].slots[slot],
        };
        bucket.retain(|&index| index != alarm.index);

        Some(entry.value)
    }

    /// Returns the earliest pending alarm time.
    pub fn next_alarm_fires_at(&self) -> Option<Time> {
        if self.entries.is_empty() {
            return None;
        }

        let mut earliest = self.min_at(&self.current);

        for level in &self.levels {
            let now_bucket = self.now_key >> level.shift;
            let occupied = (1..level.slot_count())
                .map(|step| &level.slots[((now_bucket + step) & level.mask()) as usize])
                .find(|bucket| !bucket.is_empty());

            if let Some(bucket) = occupied {
                earliest = match (earliest, self.min_at(bucket)) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }

        earliest
    }

    /// Moves now forward to `to`, firing every alarm whose key interval ends
    /// at or before the start of `to`'s interval.
    ///
    /// Alarms in the interval containing `to` are not fired even if their
    /// time is `<= to`; use [`fire_past_alarms`](Self::fire_past_alarms) for
    /// those. Moving backwards is a no-op.
    pub fn advance_clock(&mut self, to: Time, handle_fired: impl FnMut(Time, V)) {
        if to <= self.now {
            return;
        }

        let new_key = self.key_of(to);
        let old_key = self.now_key;
        self.now = to;

        if new_key == old_key {
            return;
        }

        self.now_key = new_key;
        let mut fired = mem::take(&mut self.current);

        for level_index in 0..self.levels.len() {
            let (shift, slot_count, mask) = {
                let level = &self.levels[level_index];
                (level.shift, level.slot_count(), level.mask())
            };

            let old_bucket = old_key >> shift;
            let new_bucket = new_key >> shift;
            if new_bucket == old_bucket {
                break;
            }

            let steps = (new_bucket - old_bucket).min(slot_count);
            for step in 1..=steps {
                let slot = ((old_bucket + step) & mask) as usize;
                let bucket = mem::take(&mut self.levels[level_index].slots[slot]);

                for index in bucket {
                    if self.entries[index].key < new_key {
                        fired.push(index);
                    } else {
                        self.place(index);
                    }
                }
            }
        }

        self.dispatch(fired, handle_fired);
    }

    /// Fires the alarms of the current interval whose time is `<= now`.
    pub fn fire_past_alarms(&mut self, handle_fired: impl FnMut(Time, V)) {
        let now = self.now;
        let current = mem::take(&mut self.current);
        let entries = &self.entries;

        let (due, pending): (Vec<usize>, Vec<usize>) = current
            .into_iter()
            .partition(|&index| entries[index].at <= now);

        self.current = pending;
        self.dispatch(due, handle_fired);
    }

    fn key_of(&self, at: Time) -> u64 {
        at.as_nanos() >> self.precision_bits
    }

    fn min_at(&self, bucket: &[usize]) -> Option<Time> {
        bucket.iter().map(|&index| self.entries[index].at).min()
    }

    fn place(&mut self, index: usize) {
        let location = self.location_for(self.entries[index].key);

        match location {
            Location::Current => self.current.push(index),
            Location::Level { level, slot } => self.levels[level].slots[slot].push(index),
        }

        self.entries[index].location = location;
    }

    fn location_for(&self, key: u64) -> Location {
        if key <= self.now_key {
            return Location::Current;
        }

        for (level_index, level) in self.levels.iter().enumerate() {
            let bucket = key >> level.shift;
            let now_bucket = self.now_key >> level.shift;

            if bucket > now_bucket && bucket - now_bucket < level.slot_count() {
                return Location::Level {
                    level: level_index,
                    slot: (bucket & level.mask()) as usize,
                };
            }
        }

        // Only reachable past max_allowed_alarm_time, which `add` rejects.
        let top = self.levels.len() - 1;
        let level = &self.levels[top];
        Location::Level {
            level: top,
            slot: ((key >> level.shift) & level.mask()) as usize,
        }
    }

    fn dispatch(&mut self, indices: Vec<usize>, mut handle_fired: impl FnMut(Time, V)) {
        let mut fired: Vec<Entry<V>> = indices
            .into_iter()
            .map(|index| self.entries.remove(index))
            .collect();

        fired.sort_by_key(|entry| (entry.at, entry.id));

        for entry in fired {
            handle_fired(entry.at, entry.value);
        }
    }
}
