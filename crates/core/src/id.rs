//! 对象标识生成
//!
//! 64位时间有序标识（最高位恒为0）：
//! 41位自 2020-01-01 起的毫秒数 | 10位进程节点 | 12位序列号。
//! 不同进程之间无需协调，同一进程内严格单调递增。

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

const EPOCH_MILLIS: u64 = 1_577_836_800_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(i64);

impl ObjectId {
    /// 使用进程级生成器产生新的标识
    pub fn generate() -> Self {
        IdGenerator::global().next_id()
    }

    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// 标识中编码的创建时间（Unix毫秒）
    pub fn timestamp_millis(self) -> i64 {
        ((self.0 as u64) >> (NODE_BITS + SEQUENCE_BITS)) as i64 + EPOCH_MILLIS as i64
    }

    pub fn node(self) -> u16 {
        (((self.0 as u64) >> SEQUENCE_BITS) & NODE_MASK) as u16
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(ObjectId)
    }
}

struct GeneratorState {
    last_millis: u64,
    sequence: u64,
}

pub struct IdGenerator {
    node: u64,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new(node: u16) -> Self {
        Self {
            node: node as u64 & NODE_MASK,
            state: Mutex::new(GeneratorState {
                last_millis: 0,
                sequence: 0,
            }),
        }
    }

    pub fn global() -> &'static IdGenerator {
        static GENERATOR: OnceLock<IdGenerator> = OnceLock::new();
        GENERATOR.get_or_init(|| IdGenerator::new(process_node()))
    }

    pub fn next_id(&self) -> ObjectId {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // 时钟回拨时沿用上一次的时间戳
        let mut millis = now_millis().max(state.last_millis);
        if millis == state.last_millis {
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                millis += 1;
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }
        state.last_millis = millis;

        let raw = (millis << (NODE_BITS + SEQUENCE_BITS))
            | (self.node << SEQUENCE_BITS)
            | state.sequence;
        ObjectId((raw & (i64::MAX as u64)) as i64)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MILLIS)
        .saturating_sub(EPOCH_MILLIS)
}

fn process_node() -> u16 {
    let mut hasher = DefaultHasher::new();
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    rand::random::<u64>().hash(&mut hasher);
    (hasher.finish() & NODE_MASK) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_strictly_increase() {
        let generator = IdGenerator::new(7);
        let mut previous = generator.next_id();
        for _ in 0..20_000 {
            let next = generator.next_id();
            assert!(next > previous);
            previous = next;
        }
        assert_eq!(previous.node(), 7);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..2_000).map(|_| ObjectId::generate()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let id = ObjectId::generate();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        assert!((now - id.timestamp_millis()).abs() < 5_000);
        assert!(id.as_i64() > 0);
        assert_eq!(id.to_string().parse::<ObjectId>().unwrap(), id);
    }
}
