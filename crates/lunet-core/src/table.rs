//! Hybrid array+hash table.
//!
//! Integer keys near the front live in a dense array part; everything else
//! lives in an insertion-ordered hash part. Integer-valued floats and the
//! equal integers are the same key. The array part may absorb hash entries
//! when a write lands just past its end (see `maybe_extend`).

use crate::heap::Ref;
use crate::string::StrId;
use crate::value::Value;
use indexmap::IndexMap;
use std::cell::Cell;

/// A key in the hash part. Reference kinds hash by arena identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    Str(StrId),
    /// Float key that is not integer-valued, stored as raw bits.
    Float(u64),
    Bool(bool),
    Table(u32),
    Function(u32),
    Userdata(u32),
}

/// Error for invalid table keys (nil or NaN).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyError {
    Nil,
    NaN,
}

impl KeyError {
    pub fn message(self) -> &'static str {
        match self {
            KeyError::Nil => "table index is nil",
            KeyError::NaN => "table index is NaN",
        }
    }
}

/// A self-contained iteration cursor. Unlike `next`, a cursor survives
/// concurrent iterations over the same table and never rescans.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cursor {
    array_pos: usize,
    hash_pos: usize,
    in_hash: bool,
}

/// A Lua table.
pub struct Table {
    /// Dense part; `array[i]` holds the entry for key `base + i`.
    array: Vec<Value>,
    /// Hash part for everything else (insertion-order preserving).
    hash: IndexMap<TableKey, Value>,
    /// First array key. Lua proper uses 1; the offset is configurable.
    base: i64,
    /// Cached border for the length operator, None when stale.
    cached_len: Cell<Option<i64>>,
    /// Meta-table, if any.
    pub metatable: Option<Ref<Table>>,
}

impl Table {
    /// Create a table with capacity hints for the two parts.
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            base: 1,
            cached_len: Cell::new(None),
            metatable: None,
        }
    }

    /// Create a table whose array part starts at `base` instead of 1.
    pub fn with_base(base: i64) -> Self {
        Table {
            base,
            ..Table::new(0, 0)
        }
    }

    /// Normalize a value to a hash key. Integer-valued floats collapse to
    /// the integer key. Returns an error for nil and NaN.
    pub fn normalize_key(key: Value) -> Result<TableKey, KeyError> {
        match key {
            Value::Nil => Err(KeyError::Nil),
            Value::Integer(i) => Ok(TableKey::Int(i)),
            Value::Float(f) => {
                if f.is_nan() {
                    Err(KeyError::NaN)
                } else if f.fract() == 0.0 && f >= i64::MIN as f64 && f < -(i64::MIN as f64) {
                    Ok(TableKey::Int(f as i64))
                } else {
                    Ok(TableKey::Float(f.to_bits()))
                }
            }
            Value::Boolean(b) => Ok(TableKey::Bool(b)),
            Value::String(id) => Ok(TableKey::Str(id)),
            Value::Table(r) => Ok(TableKey::Table(r.index())),
            Value::Function(r) => Ok(TableKey::Function(r.index())),
            Value::Userdata(r) => Ok(TableKey::Userdata(r.index())),
        }
    }

    fn key_to_value(k: TableKey) -> Value {
        match k {
            TableKey::Int(i) => Value::Integer(i),
            TableKey::Str(id) => Value::String(id),
            TableKey::Float(bits) => Value::Float(f64::from_bits(bits)),
            TableKey::Bool(b) => Value::Boolean(b),
            TableKey::Table(i) => Value::Table(Ref::from_index(i)),
            TableKey::Function(i) => Value::Function(Ref::from_index(i)),
            TableKey::Userdata(i) => Value::Userdata(Ref::from_index(i)),
        }
    }

    /// Raw get by arbitrary key. Unknown keys read as nil.
    pub fn get(&self, key: Value) -> Value {
        let tk = match Self::normalize_key(key) {
            Ok(tk) => tk,
            Err(_) => return Value::Nil,
        };
        if let TableKey::Int(i) = tk {
            return self.get_int(i);
        }
        self.hash.get(&tk).copied().unwrap_or(Value::Nil)
    }

    /// Raw get by integer key.
    pub fn get_int(&self, key: i64) -> Value {
        let idx = key.wrapping_sub(self.base);
        if idx >= 0 && (idx as usize) < self.array.len() {
            self.array[idx as usize]
        } else {
            self.hash
                .get(&TableKey::Int(key))
                .copied()
                .unwrap_or(Value::Nil)
        }
    }

    /// Raw get by string key.
    pub fn get_str(&self, key: StrId) -> Value {
        self.hash
            .get(&TableKey::Str(key))
            .copied()
            .unwrap_or(Value::Nil)
    }

    /// Raw set by arbitrary key. Writing nil removes the entry.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), KeyError> {
        let tk = Self::normalize_key(key)?;
        if let TableKey::Int(i) = tk {
            self.set_int(i, value);
            return Ok(());
        }
        self.hash_insert(tk, value);
        Ok(())
    }

    /// Raw set by integer key.
    pub fn set_int(&mut self, key: i64, value: Value) {
        self.cached_len.set(None);
        let idx = key.wrapping_sub(self.base);
        if idx >= 0 && (idx as usize) < self.array.len() {
            self.array[idx as usize] = value;
            return;
        }
        if idx >= 0 && !value.is_nil() && self.maybe_extend(idx as usize) {
            self.array[idx as usize] = value;
            self.absorb_from_hash();
            return;
        }
        self.hash_insert(TableKey::Int(key), value);
    }

    /// Raw set by string key.
    pub fn set_str(&mut self, key: StrId, value: Value) {
        self.hash_insert(TableKey::Str(key), value);
    }

    fn hash_insert(&mut self, key: TableKey, value: Value) {
        if matches!(key, TableKey::Int(_)) {
            self.cached_len.set(None);
        }
        if value.is_nil() {
            // Keep a tombstone only for keys that exist, so an ongoing
            // `next` can still locate its position.
            if self.hash.contains_key(&key) {
                self.hash.insert(key, Value::Nil);
            }
        } else {
            self.hash.insert(key, value);
        }
    }

    /// Decide whether a write at array offset `idx` (== current length for
    /// a plain append) should grow the array part. Appends always extend;
    /// writes further out extend only while the occupancy of the span
    /// being added stays above 50%, counting keys already in the hash.
    fn maybe_extend(&mut self, idx: usize) -> bool {
        let len = self.array.len();
        if idx == len {
            self.array.push(Value::Nil);
            return true;
        }
        if idx < len {
            return true;
        }
        // At most hash.len() keys can sit in the gap, so a span more than
        // twice that cannot reach 50% occupancy; skip the scan entirely.
        if (idx - len) as u128 > 2 * (self.hash.len() as u128 + 1) {
            return false;
        }
        // Occupancy of (len, idx]: the new entry plus any hash entries.
        let mut present = 1usize;
        for probe in len..idx {
            let key = self.base + probe as i64;
            if self
                .hash
                .get(&TableKey::Int(key))
                .is_some_and(|v| !v.is_nil())
            {
                present += 1;
            }
        }
        let span = idx - len + 1;
        if present * 2 > span {
            self.array.resize(idx + 1, Value::Nil);
            // Pull the gap entries out of the hash.
            for probe in len..idx {
                let key = self.base + probe as i64;
                if let Some(v) = self.hash.shift_remove(&TableKey::Int(key)) {
                    self.array[probe] = v;
                }
            }
            true
        } else {
            false
        }
    }

    /// Move consecutive integer entries that now border the array end out
    /// of the hash and into the array.
    fn absorb_from_hash(&mut self) {
        loop {
            let next_key = self.base + self.array.len() as i64;
            match self.hash.shift_remove(&TableKey::Int(next_key)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                Some(_) => break,
                None => break,
            }
        }
    }

    /// Raw length: a border `n` such that `t[n]` is non-nil and `t[n+1]`
    /// is nil (keys counted from the base offset). Exact for sequences;
    /// for sparse arrays any border may be returned.
    pub fn length(&self) -> i64 {
        if let Some(n) = self.cached_len.get() {
            return n;
        }
        let n = self.compute_border();
        self.cached_len.set(Some(n));
        n
    }

    fn compute_border(&self) -> i64 {
        if self.array.is_empty() || self.array[0].is_nil() {
            // Border may continue into the hash for tables that skipped
            // the array part entirely.
            if self.array.is_empty() {
                let mut n = 0i64;
                while self
                    .hash
                    .get(&TableKey::Int(self.base + n))
                    .is_some_and(|v| !v.is_nil())
                {
                    n += 1;
                }
                return n;
            }
            return 0;
        }
        if !self.array.last().unwrap().is_nil() {
            // Dense to the end; the border may extend into the hash.
            let mut n = self.array.len() as i64;
            while self
                .hash
                .get(&TableKey::Int(self.base + n))
                .is_some_and(|v| !v.is_nil())
            {
                n += 1;
            }
            return n;
        }
        // Binary search for a nil border inside the array part.
        let mut lo = 0usize;
        let mut hi = self.array.len();
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        (lo + 1) as i64
    }

    /// Whether the key currently maps to a non-nil value.
    pub fn contains(&self, key: Value) -> bool {
        !self.get(key).is_nil()
    }

    /// Resumable iteration primitive keyed by the previously returned key.
    ///
    /// Pass nil to begin. Returns `Ok(None)` at the end, and `Err(())`
    /// when the key was never in the table. Not reentrant: interleaved
    /// `next` chains over one table disturb each other's order.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: Value) -> Result<Option<(Value, Value)>, ()> {
        if key.is_nil() {
            return Ok(self.scan_array(0));
        }
        if let Ok(TableKey::Int(i)) = Self::normalize_key(key) {
            let idx = i.wrapping_sub(self.base);
            if idx >= 0 && (idx as usize) < self.array.len() {
                return Ok(self.scan_array(idx as usize + 1));
            }
        }
        let tk = match Self::normalize_key(key) {
            Ok(tk) => tk,
            Err(_) => return Err(()),
        };
        match self.hash.get_index_of(&tk) {
            Some(pos) => Ok(self.scan_hash(pos + 1)),
            None => Err(()),
        }
    }

    /// First non-nil array entry at or after `from`, else fall into the hash.
    fn scan_array(&self, from: usize) -> Option<(Value, Value)> {
        for (i, v) in self.array.iter().enumerate().skip(from) {
            if !v.is_nil() {
                return Some((Value::Integer(self.base + i as i64), *v));
            }
        }
        self.scan_hash(0)
    }

    /// First non-tombstone hash entry at or after index `pos`.
    fn scan_hash(&self, pos: usize) -> Option<(Value, Value)> {
        for i in pos..self.hash.len() {
            let (k, v) = self.hash.get_index(i).unwrap();
            if !v.is_nil() {
                return Some((Self::key_to_value(*k), *v));
            }
        }
        None
    }

    /// Advance a self-contained cursor, returning the next present pair.
    pub fn cursor_next(&self, cursor: &mut Cursor) -> Option<(Value, Value)> {
        if !cursor.in_hash {
            while cursor.array_pos < self.array.len() {
                let i = cursor.array_pos;
                cursor.array_pos += 1;
                let v = self.array[i];
                if !v.is_nil() {
                    return Some((Value::Integer(self.base + i as i64), v));
                }
            }
            cursor.in_hash = true;
        }
        while cursor.hash_pos < self.hash.len() {
            let i = cursor.hash_pos;
            cursor.hash_pos += 1;
            let (k, v) = self.hash.get_index(i).unwrap();
            if !v.is_nil() {
                return Some((Self::key_to_value(*k), *v));
            }
        }
        None
    }

    /// Number of live entries (both parts). Not the length operator.
    pub fn entry_count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count()
            + self.hash.values().filter(|v| !v.is_nil()).count()
    }

    /// All values in the array part, for bulk operations.
    pub fn array_part(&self) -> &[Value] {
        &self.array
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
