//! Per-endpoint MAVLink link: parsing plus the signing admission policy.
//!
//! A [`Link`] wraps one codec parser and, on the engineer side, the tenant's
//! signing state. Receiving runs every parsed frame through the admission
//! ladder (key present → SIGNED flag → signature verdict → SETUP_SIGNING);
//! sending withholds everything but HEARTBEAT until the peer has proven
//! itself with one good signed frame. Operator diagnostics go out as
//! unsigned STATUSTEXT on a dedicated channel so ground stations that reject
//! bad signatures still display them.

use std::{
    path::PathBuf,
    time::{Duration, Instant, SystemTime},
};

use keydb::KeyStore;
use mavlink_codec::{
    definitions::{MSG_ID_HEARTBEAT, MSG_ID_SETUP_SIGNING},
    frame::{encode, Frame},
    messages::{pack_statustext, SetupSigning},
    Parser, SignatureVerdict, SigningContext, MAV_SEVERITY_CRITICAL,
};
use tracing::{debug, info, warn};

/// Channel of the vehicle-side endpoint.
pub const CHAN_COMM1: u8 = 0;
/// Channel reserved for unsigned STATUSTEXT diagnostics.
pub const CHAN_STATUSTEXT: u8 = 9;

/// Channel of engineer slot `i`.
pub fn chan_comm2(slot: usize) -> u8 {
    1 + slot as u8
}

/// Restart offset added to the stored timestamp on key load, in 10 µs units
/// (150 ms). Together with the 10 s save interval this closes the replay
/// window left by an unclean shutdown.
const RESTART_TIMESTAMP_OFFSET: u64 = 15 * 100_000;

const SIGNING_SAVE_INTERVAL: Duration = Duration::from_secs(10);
const WARNING_INTERVAL: Duration = Duration::from_secs(2);

/// Bad-signature and replay frames tolerated silently before the operator is
/// told.
const BAD_SIG_QUIET_LIMIT: u32 = 2;

/// How receiving disposes of one parsed frame.
#[derive(Debug)]
pub enum Admit {
    /// Forward to the other side.
    Forward,
    /// Drop without comment.
    Drop,
    /// Drop, and write these bytes (a STATUSTEXT) back to the sender.
    DropWithNotice(Vec<u8>),
    /// Drop; apply this re-key to the tenant record first.
    SetupSigning(SetupSigning),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigningMode {
    /// Vehicle side: no admission rules, outgoing signatures stripped.
    Unsigned,
    /// Engineer side with an all-zero record: signing turned off for the
    /// tenant, the link behaves like an unsigned one.
    Disabled,
    /// Engineer side with a live key.
    Enforced,
}

pub struct Link {
    chan: u8,
    /// Tenant port2 on the engineer side, `None` on the vehicle side.
    key_id: Option<u32>,
    store_path: PathBuf,
    parser: Parser,
    mode: SigningMode,
    signing: Option<SigningContext>,
    key_loaded: bool,
    got_signed_packet: bool,
    last_sysid: u8,
    last_compid: u8,
    last_signing_save: Option<Instant>,
    last_warning: Option<Instant>,
    bad_sig_count: u32,
    statustext_seq: u8,
    /// Timestamp waiting for a background store write.
    pending_save: Option<u64>,
}

impl Link {
    /// Vehicle-side link: everything is admitted, nothing is signed.
    pub fn new_unsigned(chan: u8, store_path: PathBuf) -> Self {
        Self::new(chan, None, store_path)
    }

    /// Engineer-side link: loads the tenant's signing key and arms the
    /// timestamp.
    pub fn new_signed(chan: u8, key_id: u32, store_path: PathBuf) -> Self {
        let mut link = Self::new(chan, Some(key_id), store_path);
        link.load_signing_key();
        link.update_signing_timestamp();
        link
    }

    fn new(chan: u8, key_id: Option<u32>, store_path: PathBuf) -> Self {
        Self {
            chan,
            key_id,
            store_path,
            parser: Parser::new(),
            mode: if key_id.is_some() {
                SigningMode::Enforced
            } else {
                SigningMode::Unsigned
            },
            signing: None,
            key_loaded: false,
            got_signed_packet: false,
            last_sysid: 0,
            last_compid: 0,
            last_signing_save: None,
            last_warning: None,
            bad_sig_count: 0,
            statustext_seq: 0,
            pending_save: None,
        }
    }

    /// Feed received bytes to the parser. Call in a loop; one read may hold
    /// several frames.
    pub fn advance(&mut self, input: &[u8]) -> (usize, Option<Frame>) {
        self.parser.advance(input, self.signing.as_mut())
    }

    /// Run the admission ladder over a parsed frame.
    pub fn admit(&mut self, frame: &Frame) -> Admit {
        if self.mode != SigningMode::Enforced {
            return Admit::Forward;
        }
        let key_id = self.key_id.unwrap_or_default();

        if !self.key_loaded {
            return self.reject_with_warning("Need to setup support signing key");
        }

        if !frame.msg.is_signed() {
            self.got_signed_packet = false;
            return self.reject_with_warning("Need to use support signing key");
        }

        match frame.verdict {
            Some(SignatureVerdict::Ok) | None => {}
            Some(verdict) => {
                let text = match verdict {
                    SignatureVerdict::BadSignature | SignatureVerdict::Replay => {
                        self.bad_sig_count += 1;
                        if self.bad_sig_count <= BAD_SIG_QUIET_LIMIT {
                            self.got_signed_packet = false;
                            return Admit::Drop;
                        }
                        if verdict == SignatureVerdict::Replay {
                            "Bad signing timestamp - replay"
                        } else {
                            "Bad support signing key"
                        }
                    }
                    SignatureVerdict::OldTimestamp => "Bad signing timestamp - old timestamp",
                    SignatureVerdict::NoStreams => "Bad signing timestamp - no streams",
                    SignatureVerdict::TooManyStreams => "Bad signing timestamp - bad streams",
                    SignatureVerdict::Ok => unreachable!(),
                };
                self.got_signed_packet = false;
                return self.reject_with_warning(text);
            }
        }

        if !self.got_signed_packet {
            self.got_signed_packet = true;
            info!("[{key_id}] Got good signature");
        }
        self.bad_sig_count = 0;

        if frame.msg.msgid == MSG_ID_SETUP_SIGNING {
            return match SetupSigning::decode(&frame.msg) {
                Some(ss) => Admit::SetupSigning(ss),
                None => Admit::Drop,
            };
        }

        Admit::Forward
    }

    /// Produce the wire buffers for forwarding one frame out of this link.
    ///
    /// An empty result is deliberate success: the engineer side withholds
    /// non-HEARTBEAT traffic until authenticated without dropping the
    /// connection. An unauthenticated HEARTBEAT goes out twice, once as the
    /// untouched original bytes and once finalised by this link.
    pub fn prepare_send(&mut self, frame: &Frame) -> Result<Vec<Vec<u8>>, mavlink_codec::Error> {
        let mut out = Vec::with_capacity(1);
        match self.mode {
            SigningMode::Unsigned | SigningMode::Disabled => {
                out.push(encode(&frame.msg, None)?);
            }
            SigningMode::Enforced => {
                if !self.got_signed_packet && frame.msg.msgid != MSG_ID_HEARTBEAT {
                    return Ok(out);
                }
                if frame.msg.msgid == MSG_ID_HEARTBEAT {
                    // STATUSTEXT replies go back to whoever heartbeats here
                    self.last_sysid = frame.msg.sysid;
                    self.last_compid = frame.msg.compid;
                    if !self.got_signed_packet {
                        out.push(frame.raw.clone());
                    }
                }
                if self.key_loaded {
                    self.update_signing_timestamp();
                }
                out.push(encode(&frame.msg, self.signing.as_mut())?);
            }
        }
        Ok(out)
    }

    /// Apply a verified SETUP_SIGNING: persist the new key and timestamp,
    /// then force the peer to re-prove itself against the new key.
    pub fn apply_setup_signing(&mut self, setup: &SetupSigning) {
        let Some(key_id) = self.key_id else { return };
        match self.rekey_record(key_id, setup) {
            Ok(true) => info!("[{key_id}] Set new signing key"),
            Ok(false) => warn!("Bad key {key_id}"),
            Err(e) => warn!("[{key_id}] Failed to store new signing key: {e}"),
        }
        self.got_signed_packet = false;
        self.load_signing_key();
    }

    fn rekey_record(&self, key_id: u32, setup: &SetupSigning) -> Result<bool, keydb::Error> {
        let store = KeyStore::open(&self.store_path)?;
        let mut txn = store.begin()?;
        let Some(mut record) = txn.load(key_id)? else {
            return Ok(false);
        };
        record.timestamp = setup.initial_timestamp;
        record.secret_key = setup.secret_key;
        txn.save(key_id, &record)?;
        txn.commit()?;
        Ok(true)
    }

    /// Load (or reload) the signing key from the tenant record.
    fn load_signing_key(&mut self) {
        let Some(key_id) = self.key_id else { return };
        self.key_loaded = false;
        self.signing = None;

        let record = match KeyStore::open(&self.store_path).and_then(|s| s.load(key_id)) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Failed to find signing key for ID {key_id}");
                return;
            }
            Err(e) => {
                warn!("Failed to load signing key for {key_id}: {e}");
                return;
            }
        };

        self.key_loaded = true;
        if record.signing_disabled() {
            self.mode = SigningMode::Disabled;
            debug!("[{key_id}] signing disabled by record");
        } else {
            self.mode = SigningMode::Enforced;
            self.signing = Some(SigningContext::new(
                record.secret_key,
                self.chan,
                record.timestamp + RESTART_TIMESTAMP_OFFSET,
            ));
        }
    }

    /// Raise the signing timestamp to wall clock, at most once per save
    /// interval, and queue the new watermark for a background store write.
    fn update_signing_timestamp(&mut self) {
        let Some(signing) = self.signing.as_mut() else {
            return;
        };
        if let Some(last) = self.last_signing_save {
            if last.elapsed() < SIGNING_SAVE_INTERVAL {
                return;
            }
        }
        self.last_signing_save = Some(Instant::now());

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        signing.raise_timestamp(SigningContext::wall_clock_timestamp(now));
        self.pending_save = Some(signing.timestamp);
    }

    /// Take the timestamp queued by [`update_signing_timestamp`], if any; the
    /// session spawns the store write so the event loop never blocks on it.
    pub fn take_pending_save(&mut self) -> Option<(PathBuf, u32, u64)> {
        let timestamp = self.pending_save.take()?;
        Some((self.store_path.clone(), self.key_id?, timestamp))
    }

    /// Rate-limited operator warning, or `Drop` when inside the quiet
    /// window.
    fn reject_with_warning(&mut self, text: &str) -> Admit {
        if !self.periodic_warning() {
            return Admit::Drop;
        }
        match self.statustext(text) {
            Some(bytes) => Admit::DropWithNotice(bytes),
            None => Admit::Drop,
        }
    }

    fn periodic_warning(&mut self) -> bool {
        if let Some(last) = self.last_warning {
            if last.elapsed() < WARNING_INTERVAL {
                return false;
            }
        }
        self.last_warning = Some(Instant::now());
        true
    }

    /// Encode a STATUSTEXT on the dedicated unsigned channel, addressed to
    /// the engineer's last-seen system.
    fn statustext(&mut self, text: &str) -> Option<Vec<u8>> {
        let mut msg = pack_statustext(
            self.last_sysid,
            self.last_compid,
            MAV_SEVERITY_CRITICAL,
            text,
        );
        msg.seq = self.statustext_seq;
        self.statustext_seq = self.statustext_seq.wrapping_add(1);
        if let Some(key_id) = self.key_id {
            info!("[{key_id}]: {text}");
        }
        encode(&msg, None).ok()
    }

    pub fn authenticated(&self) -> bool {
        self.got_signed_packet
    }
}

/// Persist a timestamp watermark, raising but never lowering the stored
/// value. Best-effort by design: the next save interval retries.
pub fn save_signing_timestamp(store_path: PathBuf, key_id: u32, timestamp: u64) {
    let result = (|| -> Result<(), keydb::Error> {
        let store = KeyStore::open(&store_path)?;
        let mut txn = store.begin()?;
        let Some(mut record) = txn.load(key_id)? else {
            debug!("Bad key {key_id}");
            return Ok(());
        };
        if timestamp > record.timestamp {
            record.timestamp = timestamp;
            txn.save(key_id, &record)?;
            txn.commit()?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        debug!("signing timestamp save for {key_id} failed: {e}");
    }
}
