use serde_json::Value;

/// One cached object.
///
/// `prev`/`next` are arena indices forming a doubly linked recency list:
/// `prev` points toward the more recently used neighbor, `next` toward the
/// less recently used one.
struct Entry {
    key: String,
    value: Value,
    /// Unix-millisecond stamp the value was (re)loaded at. Compared against
    /// the file's mtime to detect writes from other processes.
    ts: u64,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Byte-bounded LRU cache over parsed JSON trees.
///
/// Entries live in an index-keyed arena; the key → index map and the linked
/// recency list never hold references into each other, only indices, so there
/// is no pointer chasing to get wrong. Eviction drops the tail until the byte
/// total fits the configured ceiling.
pub(crate) struct LruCache {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: std::collections::HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total: usize,
}

pub(crate) struct CachedObject {
    pub value: Value,
    pub ts: u64,
}

impl LruCache {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: std::collections::HashMap::new(),
            head: None,
            tail: None,
            total: 0,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Clone out the cached value and stamp for `key`, promoting it to most
    /// recently used.
    pub fn get(&mut self, key: &str) -> Option<CachedObject> {
        let idx = *self.index.get(key)?;
        self.promote(idx);
        let entry = self.slots[idx].as_ref().unwrap();
        Some(CachedObject {
            value: entry.value.clone(),
            ts: entry.ts,
        })
    }

    /// Replace the value stored for `key`, adjusting byte accounting.
    /// Returns false if the key is not cached.
    pub fn update(&mut self, key: &str, value: Value, ts: u64, size: usize) -> bool {
        let Some(&idx) = self.index.get(key) else {
            return false;
        };
        let entry = self.slots[idx].as_mut().unwrap();
        self.total -= entry.size;
        entry.value = value;
        entry.ts = ts;
        entry.size = size;
        self.total += size;
        true
    }

    /// Insert a new entry at the most-recently-used position.
    pub fn insert(&mut self, key: String, value: Value, ts: u64, size: usize) {
        if let Some(&idx) = self.index.get(&key) {
            // Existing key: overwrite in place and promote.
            let entry = self.slots[idx].as_mut().unwrap();
            self.total -= entry.size;
            entry.value = value;
            entry.ts = ts;
            entry.size = size;
            self.total += size;
            self.promote(idx);
            return;
        }

        let entry = Entry {
            key: key.clone(),
            value,
            ts,
            size,
            prev: None,
            next: self.head,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };

        if let Some(old_head) = self.head {
            self.slots[old_head].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }

        self.index.insert(key, idx);
        self.total += size;
    }

    /// Drop `key` from the cache if present.
    pub fn remove(&mut self, key: &str) {
        if let Some(idx) = self.index.remove(key) {
            self.detach(idx);
            let entry = self.slots[idx].take().unwrap();
            self.total -= entry.size;
            self.free.push(idx);
        }
    }

    /// Evict least-recently-used entries until the byte total is within
    /// `max`. Runs after every insert and every size growth.
    pub fn evict_to(&mut self, max: usize) {
        while self.total > max {
            let Some(tail) = self.tail else {
                break;
            };
            let key = self.slots[tail].as_ref().unwrap().key.clone();
            tracing::trace!(key = %key, "evicting cached object");
            self.remove(&key);
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.total = 0;
    }

    /// Unlink `idx` from the recency list without freeing the slot.
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.slots[idx].as_ref().unwrap();
            (entry.prev, entry.next)
        };

        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }

        let entry = self.slots[idx].as_mut().unwrap();
        entry.prev = None;
        entry.next = None;
    }

    /// Move `idx` to the most-recently-used position.
    fn promote(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);

        let old_head = self.head;
        {
            let entry = self.slots[idx].as_mut().unwrap();
            entry.next = old_head;
            entry.prev = None;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Keys ordered most-recent first. Test/debug helper.
    #[cfg(test)]
    fn recency_order(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            let entry = self.slots[idx].as_ref().unwrap();
            out.push(entry.key.clone());
            cur = entry.next;
        }
        out
    }
}
