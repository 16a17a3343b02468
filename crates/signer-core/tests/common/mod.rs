//! A simulated Ledger running the Ethereum app.
//!
//! The simulator speaks the HID report framing and answers the Ethereum app
//! instructions with keys derived from the test mnemonic, so its signatures
//! are the deterministic RFC 6979 ones a device holding that seed produces.

#![allow(dead_code, unreachable_pub)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use alloy_primitives::{U256, keccak256};
use alloy_rlp::Header;
use bip39::{Language, Mnemonic};
use k256::ecdsa::SigningKey;
use ledger_evm_signer_core::ledger::apdu::status;
use ledger_evm_signer_core::ledger::app::{CLA, ins};
use ledger_evm_signer_core::ledger::framing::{Reassembler, wrap};
use ledger_evm_signer_core::ledger::{
    Apdu, ApduResponse, DeviceBackend, DeviceInfo, Hub, LedgerWallet, Transport,
};
use ledger_evm_signer_core::{DerivationPath, Error, HubConfig, PublicKey, Result};

/// The 24-word mnemonic the golden vectors were produced with.
pub const MNEMONIC: &str = "glow spread dentist swamp people siren hint muscle first sausage \
castle metal cycle abandon accident logic again around mix dial knee organ episode usual";

/// Something the simulated device saw or did, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A complete command arrived.
    Received { ins: u8, p1: u8 },
    /// A reply was put on the wire.
    Replied { status: u16 },
}

struct Device {
    seed: Vec<u8>,
    flags: u8,
    version: [u8; 3],
    reject: bool,
    hold: bool,
    plugged: bool,
    unsupported: BTreeSet<u8>,
    incoming: Reassembler,
    outgoing: VecDeque<Vec<u8>>,
    held: VecDeque<ApduResponse>,
    pending_sign: Option<Vec<u8>>,
    events: Vec<Event>,
    opens: usize,
    closes: usize,
    aborts: usize,
}

impl Device {
    fn send(&mut self, response: ApduResponse) {
        if self.hold {
            self.held.push_back(response);
            return;
        }
        self.events.push(Event::Replied {
            status: response.status_word(),
        });
        self.outgoing
            .extend(wrap(&response.to_bytes()).iter().map(|r| r.to_vec()));
    }

    fn handle(&mut self, apdu: &Apdu) -> ApduResponse {
        if apdu.cla() != CLA {
            return reply_status(status::CLA_NOT_SUPPORTED);
        }
        if self.unsupported.contains(&apdu.ins()) {
            return reply_status(status::INS_NOT_SUPPORTED);
        }
        match apdu.ins() {
            ins::GET_APP_CONFIGURATION => {
                let [major, minor, patch] = self.version;
                reply_ok(vec![self.flags, major, minor, patch])
            }
            ins::GET_ADDRESS => self.get_address(apdu),
            ins::SIGN_TRANSACTION => self.sign_chunk(apdu),
            ins::SIGN_TYPED_DATA => self.sign_typed_data(apdu),
            _ => reply_status(status::INS_NOT_SUPPORTED),
        }
    }

    fn get_address(&self, apdu: &Apdu) -> ApduResponse {
        let Some((path, _)) = split_path(apdu.data()) else {
            return reply_status(status::INVALID_DATA);
        };
        if apdu.p1() == 0x01 && self.reject {
            return reply_status(status::CONDITIONS_NOT_SATISFIED);
        }

        let public_key = public_key(&signing_key(&self.seed, &path));
        let mut data = vec![65];
        data.extend_from_slice(public_key.as_bytes());
        data.push(40);
        data.extend_from_slice(public_key.address().to_checksum_hex()[2..].as_bytes());
        reply_ok(data)
    }

    fn sign_chunk(&mut self, apdu: &Apdu) -> ApduResponse {
        match apdu.p1() {
            0x00 => self.pending_sign = Some(apdu.data().to_vec()),
            0x80 => match self.pending_sign.as_mut() {
                Some(buf) => buf.extend_from_slice(apdu.data()),
                None => return reply_status(status::CONDITIONS_NOT_SATISFIED),
            },
            _ => return reply_status(status::INCORRECT_P1_P2),
        }

        let buf = self.pending_sign.clone().unwrap_or_default();
        let Some((path, payload)) = split_path(&buf) else {
            self.pending_sign = None;
            return reply_status(status::INVALID_DATA);
        };
        match transaction_len(payload) {
            Some(total) if payload.len() >= total => {}
            _ => return reply_ok(vec![]),
        }
        self.pending_sign = None;

        if self.reject {
            return reply_status(status::CONDITIONS_NOT_SATISFIED);
        }

        let key = signing_key(&self.seed, &path);
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(keccak256(payload).as_slice())
            .unwrap();
        let rid = u8::from(recovery_id.is_y_odd());

        let mut data = vec![transaction_v(payload, rid)];
        data.extend_from_slice(&signature.to_bytes());
        reply_ok(data)
    }

    fn sign_typed_data(&self, apdu: &Apdu) -> ApduResponse {
        let Some((path, hashes)) = split_path(apdu.data()) else {
            return reply_status(status::INVALID_DATA);
        };
        if hashes.len() != 64 {
            return reply_status(status::WRONG_LENGTH);
        }
        if self.reject {
            return reply_status(status::CONDITIONS_NOT_SATISFIED);
        }

        let mut preimage = vec![0x19, 0x01];
        preimage.extend_from_slice(hashes);
        let key = signing_key(&self.seed, &path);
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(keccak256(&preimage).as_slice())
            .unwrap();

        let mut data = vec![27 + u8::from(recovery_id.is_y_odd())];
        data.extend_from_slice(&signature.to_bytes());
        reply_ok(data)
    }
}

fn reply_ok(data: Vec<u8>) -> ApduResponse {
    ApduResponse::new(data, status::OK)
}

fn reply_status(status_word: u16) -> ApduResponse {
    ApduResponse::new(vec![], status_word)
}

fn split_path(data: &[u8]) -> Option<(DerivationPath, &[u8])> {
    let depth = usize::from(*data.first()?);
    let end = 1 + depth * 4;
    let path = DerivationPath::from_bytes(data.get(..end)?).ok()?;
    Some((path, &data[end..]))
}

/// Length of the complete signing payload, once its RLP header arrived.
fn transaction_len(payload: &[u8]) -> Option<usize> {
    let prefix = usize::from(*payload.first()? == 0x01);
    let body = &payload[prefix..];
    let mut rest = body;
    let header = Header::decode(&mut rest).ok()?;
    Some(prefix + (body.len() - rest.len()) + header.payload_length)
}

/// The `v` byte the Ethereum app answers with.
fn transaction_v(payload: &[u8], rid: u8) -> u8 {
    if payload[0] == 0x01 {
        return rid;
    }
    let items = list_items(payload);
    if items.len() == 9 {
        let chain_id = U256::from_be_slice(items[6]);
        let v = chain_id * U256::from(2) + U256::from(35 + u64::from(rid));
        v.to_be_bytes::<32>()[31]
    } else {
        27 + rid
    }
}

fn list_items(encoded: &[u8]) -> Vec<&[u8]> {
    let mut buf = encoded;
    let header = Header::decode(&mut buf).unwrap();
    let mut rest = &buf[..header.payload_length];
    let mut items = Vec::new();
    while !rest.is_empty() {
        let item = Header::decode(&mut rest).unwrap();
        items.push(&rest[..item.payload_length]);
        rest = &rest[item.payload_length..];
    }
    items
}

/// Seed of [`MNEMONIC`] without passphrase.
pub fn seed() -> Vec<u8> {
    Mnemonic::parse_in(Language::English, MNEMONIC)
        .unwrap()
        .to_seed("")
        .to_vec()
}

/// The key a device holding `seed` uses at `path`.
pub fn signing_key(seed: &[u8], path: &DerivationPath) -> SigningKey {
    use coins_bip32::path::DerivationPath as Bip32Path;
    use coins_bip32::prelude::*;

    let bip32: Bip32Path = path.to_string().parse().unwrap();
    let xpriv = XPriv::root_from_seed(seed, None)
        .unwrap()
        .derive_path(&bip32)
        .unwrap();
    let key: &SigningKey = xpriv.as_ref();
    key.clone()
}

pub fn public_key(key: &SigningKey) -> PublicKey {
    PublicKey::from_bytes(key.verifying_key().to_encoded_point(false).as_bytes()).unwrap()
}

/// A simulated device; clones share state.
#[derive(Clone)]
pub struct SimulatedLedger {
    inner: Arc<(Mutex<Device>, Condvar)>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLedger {
    /// A device holding [`MNEMONIC`] running Ethereum app 1.9.17.
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(Device {
                    seed: seed(),
                    flags: 0x01,
                    version: [1, 9, 17],
                    reject: false,
                    hold: false,
                    plugged: true,
                    unsupported: BTreeSet::new(),
                    incoming: Reassembler::new(),
                    outgoing: VecDeque::new(),
                    held: VecDeque::new(),
                    pending_sign: None,
                    events: Vec::new(),
                    opens: 0,
                    closes: 0,
                    aborts: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Device> {
        self.inner.0.lock().unwrap()
    }

    fn notify(&self) {
        self.inner.1.notify_all();
    }

    pub fn with_version(self, major: u8, minor: u8, patch: u8) -> Self {
        self.lock().version = [major, minor, patch];
        self
    }

    /// Makes the user decline every confirmation.
    pub fn set_reject(&self, reject: bool) {
        self.lock().reject = reject;
    }

    /// Answers `ins` with "instruction not supported".
    pub fn disable(&self, ins: u8) {
        self.lock().unsupported.insert(ins);
    }

    /// Keeps replies back as if the user had not yet confirmed.
    pub fn hold(&self) {
        self.lock().hold = true;
    }

    /// Sends the replies kept back by [`Self::hold`] and stops holding.
    pub fn release(&self) {
        let mut device = self.lock();
        device.hold = false;
        while let Some(response) = device.held.pop_front() {
            device.send(response);
        }
        drop(device);
        self.notify();
    }

    /// Waits until a reply is being held back.
    pub fn wait_for_held(&self, timeout: Duration) -> bool {
        let device = self.lock();
        let (device, _) = self
            .inner
            .1
            .wait_timeout_while(device, timeout, |d| d.held.is_empty())
            .unwrap();
        !device.held.is_empty()
    }

    pub fn set_plugged(&self, plugged: bool) {
        self.lock().plugged = plugged;
        self.notify();
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// `(ins, p1)` of every command received.
    pub fn received(&self) -> Vec<(u8, u8)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Received { ins, p1 } => Some((ins, p1)),
                Event::Replied { .. } => None,
            })
            .collect()
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn aborts(&self) -> usize {
        self.lock().aborts
    }

    pub fn transport(&self) -> SimTransport {
        self.lock().opens += 1;
        SimTransport {
            device: self.clone(),
        }
    }
}

/// HID channel to a [`SimulatedLedger`].
pub struct SimTransport {
    device: SimulatedLedger,
}

impl Transport for SimTransport {
    fn write(&mut self, report: &[u8]) -> Result<()> {
        let mut device = self.device.lock();
        if !device.plugged {
            return Err(Error::Transport("device unplugged".to_string()));
        }
        let Some(message) = device.incoming.push(report)? else {
            return Ok(());
        };
        let apdu = Apdu::from_bytes(&message)?;
        device.events.push(Event::Received {
            ins: apdu.ins(),
            p1: apdu.p1(),
        });
        let response = device.handle(&apdu);
        device.send(response);
        drop(device);
        self.device.notify();
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let mut device = self.device.lock();
        loop {
            if !device.plugged {
                return Err(Error::Transport("device unplugged".to_string()));
            }
            if let Some(report) = device.outgoing.pop_front() {
                return Ok(Some(report));
            }
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }
            device = self.device.inner.1.wait_timeout(device, remaining).unwrap().0;
        }
    }

    fn close(&mut self) {
        let mut device = self.device.lock();
        device.closes += 1;
        device.incoming = Reassembler::new();
        device.outgoing.clear();
        device.held.clear();
    }

    fn abort(&mut self) -> Result<()> {
        let mut device = self.device.lock();
        device.aborts += 1;
        device.pending_sign = None;
        Ok(())
    }
}

/// A USB bus of simulated devices.
#[derive(Clone, Default)]
pub struct SimBackend {
    devices: Arc<Mutex<BTreeMap<String, (DeviceInfo, Option<SimulatedLedger>)>>>,
}

fn device_info(path: &str, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        path: path.to_string(),
        vendor_id,
        product_id,
        usage_page: 0xffa0,
        interface: 0,
        product: Some("Nano X".to_string()),
        serial: Some("0001".to_string()),
    }
}

impl SimBackend {
    pub fn plug(&self, path: &str, ledger: &SimulatedLedger) {
        ledger.set_plugged(true);
        self.devices.lock().unwrap().insert(
            path.to_string(),
            (device_info(path, 0x2c97, 0x4011), Some(ledger.clone())),
        );
    }

    /// Plugs a HID device that is not a Ledger.
    pub fn plug_foreign(&self, path: &str) {
        self.devices
            .lock()
            .unwrap()
            .insert(path.to_string(), (device_info(path, 0x1050, 0x0407), None));
    }

    pub fn unplug(&self, path: &str) {
        if let Some((_, Some(ledger))) = self.devices.lock().unwrap().remove(path) {
            ledger.set_plugged(false);
        }
    }
}

impl DeviceBackend for SimBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn Transport>> {
        match self.devices.lock().unwrap().get(&device.path) {
            Some((_, Some(ledger))) => Ok(Box::new(ledger.transport())),
            _ => Err(Error::DeviceNotFound(Some(device.path.clone()))),
        }
    }
}

/// Hub configuration with a short exchange timeout.
pub fn test_config() -> HubConfig {
    HubConfig {
        exchange_timeout_ms: 2_000,
        ..HubConfig::default()
    }
}

/// A hub seeing `ledger` at `usb-0`, and its opened wallet.
pub fn open_wallet(ledger: &SimulatedLedger) -> (Hub, Arc<LedgerWallet>) {
    open_wallet_with(ledger, test_config())
}

pub fn open_wallet_with(ledger: &SimulatedLedger, config: HubConfig) -> (Hub, Arc<LedgerWallet>) {
    let backend = SimBackend::default();
    backend.plug("usb-0", ledger);
    let hub = Hub::new(Arc::new(backend), config).unwrap();
    let wallet = hub.wallet(0).unwrap();
    wallet.open().unwrap();
    (hub, wallet)
}
