// src/core/commands.rs

//! The command argument-array type and the classification tables the router,
//! batch engine, and compression codec consult.
//!
//! Command-name wrapper methods live with the language bindings; the core only
//! needs a uniform `Cmd` plus knowledge of which commands are read-only, where
//! their keys sit, and which argument positions carry compressible values.

use bytes::Bytes;

/// A single command as an argument array, ready for RESP encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    /// Builds a command from a raw argument list (custom commands).
    pub fn from_args(args: Vec<Bytes>) -> Self {
        Self { args }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The command name as sent, or an empty slice for a malformed command.
    pub fn name(&self) -> &[u8] {
        self.args.first().map(|b| b.as_ref()).unwrap_or(b"")
    }

    /// Uppercased command name, used for classification and telemetry spans.
    pub fn name_uppercase(&self) -> String {
        String::from_utf8_lossy(self.name()).to_ascii_uppercase()
    }

    fn name_is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name.as_bytes())
    }

    /// The first key argument, if this command carries keys.
    pub fn first_key(&self) -> Option<&Bytes> {
        if is_keyless(self.name()) {
            return None;
        }
        self.args.get(1)
    }

    /// All key arguments for commands whose tail is a plain key list.
    pub fn key_list(&self) -> &[Bytes] {
        if is_keyless(self.name()) || self.args.len() < 2 {
            return &[];
        }
        &self.args[1..]
    }

    /// True if this command never writes and may be served by a replica.
    pub fn is_readonly(&self) -> bool {
        READONLY_COMMANDS
            .iter()
            .any(|name| self.name().eq_ignore_ascii_case(name.as_bytes()))
    }

    /// The multi-slot split shape of this command, if it has one.
    ///
    /// Only meaningful in non-atomic contexts: the router splits the key list
    /// by slot, fans out, and reassembles replies in input order.
    pub fn multi_slot_kind(&self) -> Option<MultiSlotKind> {
        if self.name_is("MGET") {
            Some(MultiSlotKind::KeyListArray)
        } else if self.name_is("DEL") || self.name_is("UNLINK") || self.name_is("TOUCH") {
            Some(MultiSlotKind::KeyListSum)
        } else if self.name_is("MSET") {
            Some(MultiSlotKind::KeyValueOk)
        } else {
            None
        }
    }

    /// Argument positions holding whole values eligible for compression.
    ///
    /// APPEND and SETRANGE are deliberately absent: they mutate stored values
    /// in place server-side, which would corrupt a compression envelope.
    pub fn compressible_value_indices(&self) -> Vec<usize> {
        if self.name_is("SET") || self.name_is("SETNX") || self.name_is("GETSET") {
            if self.args.len() > 2 { vec![2] } else { vec![] }
        } else if self.name_is("SETEX") || self.name_is("PSETEX") {
            if self.args.len() > 3 { vec![3] } else { vec![] }
        } else if self.name_is("MSET") || self.name_is("MSETNX") {
            // MSET k1 v1 k2 v2 ... -> value positions 2, 4, 6, ...
            (2..self.args.len()).step_by(2).collect()
        } else {
            vec![]
        }
    }

    /// True if bulk replies to this command should be sniffed for the
    /// compression envelope.
    pub fn is_compressible_read(&self) -> bool {
        self.name_is("GET") || self.name_is("MGET") || self.name_is("GETEX") || self.name_is("GETDEL")
    }

    pub(crate) fn set_arg(&mut self, index: usize, value: Bytes) {
        if index < self.args.len() {
            self.args[index] = value;
        }
    }
}

/// How a multi-key command's per-slot replies reassemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiSlotKind {
    /// MGET: one reply element per key, in input order.
    KeyListArray,
    /// DEL / UNLINK / TOUCH: integer replies summed.
    KeyListSum,
    /// MSET: key/value pairs, every shard must answer OK.
    KeyValueOk,
}

/// Commands that carry no key in argument position 1.
fn is_keyless(name: &[u8]) -> bool {
    KEYLESS_COMMANDS
        .iter()
        .any(|k| name.eq_ignore_ascii_case(k.as_bytes()))
}

const KEYLESS_COMMANDS: &[&str] = &[
    "PING", "HELLO", "AUTH", "SELECT", "ECHO", "CLUSTER", "INFO", "CONFIG", "CLIENT", "COMMAND",
    "DBSIZE", "DEBUG", "FLUSHALL", "FLUSHDB", "SCRIPT", "SCAN", "WAIT", "RESET", "READONLY",
    "READWRITE", "MULTI", "EXEC", "DISCARD", "UNWATCH", "SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE",
    "PUNSUBSCRIBE", "PUBSUB", "SWAPDB", "LOLWUT", "FUNCTION", "LATENCY", "MEMORY", "SLOWLOG",
    "TIME", "FAILOVER", "SHUTDOWN", "LASTSAVE", "SAVE", "BGSAVE", "BGREWRITEAOF", "RANDOMKEY",
];

const READONLY_COMMANDS: &[&str] = &[
    "GET", "MGET", "GETRANGE", "STRLEN", "EXISTS", "TTL", "PTTL", "TYPE", "TOUCH", "KEYS", "SCAN",
    "DUMP", "EXPIRETIME", "PEXPIRETIME", "RANDOMKEY", "OBJECT", "MEMORY", "BITCOUNT", "BITPOS",
    "GETBIT", "HGET", "HGETALL", "HMGET", "HKEYS", "HVALS", "HLEN", "HEXISTS", "HSTRLEN", "HSCAN",
    "HRANDFIELD", "LRANGE", "LLEN", "LINDEX", "LPOS", "SMEMBERS", "SCARD", "SISMEMBER",
    "SMISMEMBER", "SRANDMEMBER", "SSCAN", "SINTER", "SINTERCARD", "SUNION", "SDIFF", "ZRANGE",
    "ZRANGEBYSCORE", "ZRANGEBYLEX", "ZREVRANGE", "ZREVRANGEBYSCORE", "ZREVRANGEBYLEX", "ZCARD",
    "ZCOUNT", "ZSCORE", "ZMSCORE", "ZRANK", "ZREVRANK", "ZLEXCOUNT", "ZRANDMEMBER", "ZSCAN",
    "ZDIFF", "ZINTER", "ZINTERCARD", "ZUNION", "XRANGE", "XREVRANGE", "XLEN", "XREAD", "XINFO",
    "GEOPOS", "GEODIST", "GEOHASH", "GEOSEARCH", "PFCOUNT", "DBSIZE", "SORT_RO", "BITFIELD_RO",
    "GEORADIUS_RO", "GEORADIUSBYMEMBER_RO",
];

/// Shorthand constructor mirroring the builder call sites.
pub fn cmd(name: &str) -> Cmd {
    Cmd::new(name)
}
