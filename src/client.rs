//! A stateless cluster client for a replicated memcached-protocol keyspace.
//!
//! Keys are hashed with 32-bit FNV-1a into a fixed hash space that a
//! power-of-two number of buckets partitions into equal contiguous ranges.
//! Each bucket owns an ordered list of replica endpoints, sorted by the
//! hash of the endpoint string, and the same endpoint typically appears in
//! many buckets. The router holds no mutable state after construction:
//! replicas that die are never removed, they just fail their calls.
//!
//! Reads walk a bucket's replicas in order and the first value found wins;
//! replicas earlier in the list that missed are then repaired by writing
//! the value back to them ("self-heal"). Writes go to every replica in the
//! bucket and succeed once `W` replicas accept; a write that falls short
//! of `W` is compensated by reading the key back, which both checks
//! whether the value survived somewhere and spreads it further.
//!
//! The client never raises from the data path: `get` returns the value or
//! absence, `set` and `delete` return a success boolean. Replica errors
//! count as absence (reads) or failure (writes). There are no retries and
//! no engine-level deadlines.

use crate::error::{Error, Result};
use crate::hash::fnv1a;
use crate::{errdata, errinput};

use serde::Deserialize;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

/// One replica endpoint and the bucket ids it owns.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// The endpoint as host:port.
    pub addr: String,
    /// The bucket ids this endpoint is a replica for.
    pub buckets: Vec<u32>,
}

/// Cluster client configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterConfig {
    /// The replica endpoints and the buckets each owns.
    pub servers: Vec<ServerConfig>,
    /// Number of buckets partitioning the 32-bit hash space. Must be a
    /// power of two.
    pub buckets_count: u32,
    /// Replication factor. Advisory: the engine uses whatever replicas a
    /// bucket contains.
    pub n: u32,
    /// Write quorum threshold.
    pub w: u32,
    /// Read quorum threshold. Advisory: reads conclude absence only after
    /// every replica in the bucket has answered absent.
    pub r: u32,
}

impl ClusterConfig {
    /// Returns a config with the given servers and default parameters.
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self { servers, buckets_count: 16, n: 3, w: 1, r: 1 }
    }

    /// Loads the config from the given file, applying defaults and
    /// BEANCASK_* environment variables.
    pub fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("buckets_count", 16_i64)?
            .set_default("n", 3_i64)?
            .set_default("w", 1_i64)?
            .set_default("r", 1_i64)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("BEANCASK"))
            .build()?
            .try_deserialize()?)
    }
}

/// A client for one memcached-protocol replica. Connects lazily and
/// reconnects after a failed call; while the endpoint is unreachable every
/// call fails. Safe to call from multiple threads; calls are serialized on
/// the connection.
struct Replica {
    addr: String,
    conn: Mutex<Option<Connection>>,
}

impl Replica {
    /// Opens a client for the given endpoint. Connection failure is logged
    /// but not fatal: the replica remains, failing calls until the
    /// endpoint comes back.
    fn new(addr: String) -> Self {
        let conn = match Connection::connect(&addr) {
            Ok(conn) => Some(conn),
            Err(err) => {
                log::error!("connecting to replica {addr} failed: {err}");
                None
            }
        };
        Self { addr, conn: Mutex::new(conn) }
    }

    /// Fetches a key, or None if the replica doesn't have it.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| conn.get(key))
    }

    /// Stores a key, returning whether the replica accepted it.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.with_conn(|conn| conn.set(key, value))
    }

    /// Deletes a key. Deleting an absent key counts as success.
    fn delete(&self, key: &[u8]) -> Result<bool> {
        self.with_conn(|conn| conn.delete(key))
    }

    /// Runs a call against the connection, reconnecting first if there is
    /// none. A failed call drops the connection, so the next call starts
    /// with a fresh connect.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut slot = self.conn.lock()?;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => Connection::connect(&self.addr)?,
        };
        let result = f(&mut conn);
        if result.is_ok() {
            *slot = Some(conn);
        }
        result
    }
}

/// A memcached text protocol connection.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { reader, writer: BufWriter::new(stream) })
    }

    /// Reads one CRLF-terminated response line.
    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return errdata!("connection closed");
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Sends `get key` and reads back a VALUE block or a bare END.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.writer.write_all(b"get ")?;
        self.writer.write_all(key)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;

        let line = self.read_line()?;
        if line == "END" {
            return Ok(None);
        }
        let Some(header) = line.strip_prefix("VALUE ") else {
            return errdata!("unexpected get response {line:?}");
        };
        // VALUE <key> <flags> <bytes>
        let size: usize = match header.split_whitespace().nth(2) {
            Some(field) => field
                .parse()
                .map_err(|_| Error::InvalidData(format!("bad value size {field:?}")))?,
            None => return errdata!("malformed get response {line:?}"),
        };
        let mut value = vec![0; size];
        self.reader.read_exact(&mut value)?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf)?;
        if &crlf != b"\r\n" {
            return errdata!("missing CRLF after value");
        }
        match self.read_line()?.as_str() {
            "END" => Ok(Some(value)),
            line => errdata!("expected END, got {line:?}"),
        }
    }

    /// Sends `set key 0 0 <bytes>` with the value and reads the reply.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.writer.write_all(b"set ")?;
        self.writer.write_all(key)?;
        write!(self.writer, " 0 0 {}\r\n", value.len())?;
        self.writer.write_all(value)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(self.read_line()? == "STORED")
    }

    /// Sends `delete key` and reads the reply. NOT_FOUND counts as
    /// success: the key is gone either way.
    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.writer.write_all(b"delete ")?;
        self.writer.write_all(key)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(matches!(self.read_line()?.as_str(), "DELETED" | "NOT_FOUND"))
    }
}

/// A sharding, quorum-reading cluster client. See the module
/// documentation for the read/write semantics.
pub struct Cluster {
    /// Replica lists per bucket, each sorted by endpoint hash. Replicas
    /// are shared across buckets.
    buckets: Vec<Vec<Arc<Replica>>>,
    /// The width of each bucket's slice of the 32-bit hash space.
    bucket_size: u64,
    /// Write quorum threshold.
    w: u32,
}

impl Cluster {
    /// Builds the bucket map and connects to every endpoint. Endpoints
    /// that can't be reached are kept and will fail their calls.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let count = config.buckets_count;
        if count == 0 || !count.is_power_of_two() {
            return errinput!("buckets_count {count} must be a power of two");
        }
        let mut buckets: Vec<Vec<Arc<Replica>>> = vec![Vec::new(); count as usize];
        for server in &config.servers {
            let replica = Arc::new(Replica::new(server.addr.clone()));
            for &id in &server.buckets {
                if id >= count {
                    return errinput!("bucket id {id} out of range for {count} buckets");
                }
                buckets[id as usize].push(replica.clone());
            }
        }
        // Sort every bucket's replica list by endpoint hash. The sort is
        // stable, so endpoints hashing equal keep registration order.
        for bucket in &mut buckets {
            bucket.sort_by_key(|replica| fnv1a(replica.addr.as_bytes()));
        }
        log::info!("sharded {} endpoints across {count} buckets", config.servers.len());
        Ok(Self { buckets, bucket_size: (1 << 32) / count as u64, w: config.w })
    }

    /// Maps a key to its bucket.
    fn bucket(&self, key: &[u8]) -> usize {
        (fnv1a(key) as u64 / self.bucket_size) as usize
    }

    /// The ordered replica list for a key.
    fn replicas(&self, key: &[u8]) -> &[Arc<Replica>] {
        &self.buckets[self.bucket(key)]
    }

    /// Fetches a key. Walks the bucket's replicas in order; the first
    /// value found wins and is written back to every earlier replica that
    /// missed (self-heal, failures ignored). Returns None once every
    /// replica has answered absent or failed.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if !valid_key(key) {
            return None;
        }
        let replicas = self.replicas(key);
        for (i, replica) in replicas.iter().enumerate() {
            match replica.get(key) {
                Ok(Some(value)) => {
                    for stale in &replicas[..i] {
                        if let Err(err) = stale.set(key, &value) {
                            log::debug!("self-heal set on {} failed: {err}", stale.addr);
                        }
                    }
                    return Some(value);
                }
                Ok(None) => {}
                Err(err) => log::debug!("get on {} failed: {err}", replica.addr),
            }
        }
        None
    }

    /// Stores a key on every replica in its bucket, succeeding once `W`
    /// replicas accept. A write short of `W` is compensated by reading the
    /// key back: if the write's value comes back, some replica holds it
    /// (and the read has spread it further), so the write counts as
    /// successful.
    pub fn set(&self, key: &[u8], value: &[u8]) -> bool {
        if !valid_key(key) {
            return false;
        }
        let mut accepted = 0;
        for replica in self.replicas(key) {
            match replica.set(key, value) {
                Ok(true) => accepted += 1,
                Ok(false) => log::debug!("set on {} not stored", replica.addr),
                Err(err) => log::debug!("set on {} failed: {err}", replica.addr),
            }
        }
        if accepted >= self.w {
            return true;
        }
        self.get(key).as_deref() == Some(value)
    }

    /// Deletes a key from every replica in its bucket, succeeding once `W`
    /// replicas accept. Deleting an absent key counts as accepted.
    pub fn delete(&self, key: &[u8]) -> bool {
        if !valid_key(key) {
            return false;
        }
        let mut accepted = 0;
        for replica in self.replicas(key) {
            match replica.delete(key) {
                Ok(true) => accepted += 1,
                Ok(false) => log::debug!("delete on {} failed", replica.addr),
                Err(err) => log::debug!("delete on {} failed: {err}", replica.addr),
            }
        }
        accepted >= self.w
    }
}

/// Returns false for keys the memcached text protocol cannot carry:
/// empty keys and keys containing whitespace or control bytes.
fn valid_key(key: &[u8]) -> bool {
    !key.is_empty() && !key.iter().any(|&b| b <= b' ' || b == 0x7f)
}
