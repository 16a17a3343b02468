//! Error taxonomy as seen through the wallet API.

// Silence unused crate dependency warnings for test binary
#[cfg(feature = "hidapi")]
use hidapi as _;
use hex as _;
use serde as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

mod common;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use common::{SimBackend, SimulatedLedger, open_wallet, test_config};
use ledger_evm_signer_core::ledger::app::ins;
use ledger_evm_signer_core::{
    CancelToken, DerivationPath, Eip712Domain, Error, Hub, TypedData, UnsignedTransaction,
    WalletStatus,
};
use serde_json::json;

fn tx() -> UnsignedTransaction {
    UnsignedTransaction::new_legacy(
        8,
        U256::from(5),
        50,
        "0x4646464646464646464646464646464646464646",
        U256::from(70),
        vec![0x11; 600],
    )
    .unwrap()
}

fn typed() -> TypedData {
    TypedData::new(
        Eip712Domain {
            name: Some("Test".to_string()),
            version: Some("1".to_string()),
            chain_id: Some(U256::from(1)),
            verifying_contract: None,
            salt: None,
        },
        json!({"Note": [{"name": "body", "type": "string"}]}),
        "Note".to_string(),
        json!({"body": "hi"}),
    )
    .unwrap()
}

#[test]
fn rejected_address_confirmation() {
    let ledger = SimulatedLedger::new();
    let (_hub, wallet) = open_wallet(&ledger);
    ledger.set_reject(true);

    assert!(matches!(
        wallet.derive(&DerivationPath::ethereum(0), true),
        Err(Error::UserRejected)
    ));
    // nothing to confirm without display
    assert!(wallet.derive(&DerivationPath::ethereum(0), false).is_ok());
    assert!(wallet.is_open());
}

#[test]
fn rejected_signatures_keep_wallet_open() {
    let ledger = SimulatedLedger::new();
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();
    ledger.set_reject(true);

    let err = wallet.sign_transaction(&account, &tx()).unwrap_err();
    assert!(matches!(err, Error::UserRejected));
    assert!(!err.is_retryable());
    assert!(wallet.is_open());

    assert!(matches!(
        wallet.sign_typed_data(&account, &typed()),
        Err(Error::UserRejected)
    ));

    ledger.set_reject(false);
    assert!(wallet.sign_transaction(&account, &tx()).is_ok());
}

#[test]
fn old_app_cannot_sign_typed_data() {
    let ledger = SimulatedLedger::new().with_version(1, 4, 0);
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();
    let sent = ledger.received().len();

    assert!(matches!(
        wallet.sign_typed_data(&account, &typed()),
        Err(Error::UnsupportedOperation(_))
    ));
    assert_eq!(ledger.received().len(), sent);
    // legacy signing still works
    assert!(wallet.sign_transaction(&account, &tx()).is_ok());
}

#[test]
fn old_app_cannot_sign_access_list_transactions() {
    let ledger = SimulatedLedger::new().with_version(1, 8, 2);
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();

    let typed_tx = tx().with_chain_id(U256::from(1)).with_access_list(vec![]);
    assert!(matches!(
        wallet.sign_transaction(&account, &typed_tx),
        Err(Error::UnsupportedOperation(_))
    ));
}

#[test]
fn instruction_not_supported_by_device() {
    let ledger = SimulatedLedger::new();
    ledger.disable(ins::SIGN_TYPED_DATA);
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();

    assert!(matches!(
        wallet.sign_typed_data(&account, &typed()),
        Err(Error::UnsupportedOperation(_))
    ));
    assert!(wallet.is_open());
}

#[test]
fn schema_errors_never_reach_the_device() {
    let ledger = SimulatedLedger::new();
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();
    let sent = ledger.received().len();

    let mut undeclared = typed();
    undeclared
        .types
        .get_mut("Note")
        .unwrap()
        .push(ledger_evm_signer_core::TypeField::new("author", "Person"));
    let mut missing_primary = typed();
    missing_primary.primary_type = "Letter".to_string();

    for bad in [undeclared, missing_primary] {
        let err = wallet.sign_typed_data(&account, &bad).unwrap_err();
        assert!(matches!(err, Error::SchemaError(_)), "{err}");
        assert!(err.is_local());
    }
    assert_eq!(ledger.received().len(), sent);
}

#[test]
fn closed_wallet_refuses_requests() {
    let ledger = SimulatedLedger::new();
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();

    wallet.close();
    wallet.close();
    assert_eq!(wallet.status(), WalletStatus::Closed);
    assert!(matches!(
        wallet.derive(&DerivationPath::ethereum(0), false),
        Err(Error::NotOpen)
    ));
    assert!(matches!(
        wallet.sign_transaction(&account, &tx()),
        Err(Error::NotOpen)
    ));
    assert_eq!(ledger.closes(), 1);

    // reopen, derive again, sign
    wallet.open().unwrap();
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();
    assert!(wallet.sign_transaction(&account, &tx()).is_ok());
    assert_eq!(ledger.opens(), 2);
}

#[test]
fn invalid_path_text_is_local() {
    for text in ["44'/60'/0'/0/0", "m/", "m/44'/x/0", "m/44'/60'/99999999999"] {
        let err = text.parse::<DerivationPath>().unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)), "{text}");
        assert!(err.is_local());
    }
}

#[test]
fn timeout_releases_and_closes_the_session() {
    let ledger = SimulatedLedger::new();
    let mut config = test_config();
    config.exchange_timeout_ms = 100;
    let (_hub, wallet) = common::open_wallet_with(&ledger, config);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();

    ledger.hold();
    let err = wallet.sign_transaction(&account, &tx()).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_retryable());
    assert!(!wallet.is_open());
    assert_eq!(ledger.closes(), 1);

    // the user never answered; a fresh session works again
    ledger.release();
    wallet.open().unwrap();
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();
    assert!(wallet.sign_transaction(&account, &tx()).is_ok());
}

#[test]
fn cancellation_before_sending() {
    let ledger = SimulatedLedger::new();
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();
    let sent = ledger.received().len();

    let token = CancelToken::new();
    token.cancel();
    let options = wallet.default_options().clone().with_cancel(token);
    assert!(matches!(
        wallet.sign_transaction_with(&account, &tx(), &options),
        Err(Error::Cancelled)
    ));
    assert_eq!(ledger.received().len(), sent);
    assert!(wallet.is_open());
    assert_eq!(ledger.aborts(), 0);
}

#[test]
fn unplugged_device_is_a_transport_error() {
    let ledger = SimulatedLedger::new();
    let backend = SimBackend::default();
    backend.plug("usb-0", &ledger);
    let hub = Hub::new(Arc::new(backend.clone()), test_config()).unwrap();
    let wallet = hub.wallet(0).unwrap();
    wallet.open().unwrap();
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();

    backend.unplug("usb-0");
    assert!(matches!(
        wallet.sign_transaction(&account, &tx()),
        Err(Error::Transport(_))
    ));
    assert!(!wallet.is_open());

    hub.refresh().unwrap();
    assert!(matches!(hub.wallet(0), Err(Error::DeviceNotFound(None))));
    assert!(matches!(
        hub.wallet_by_path("usb-0"),
        Err(Error::DeviceNotFound(Some(_)))
    ));
}

#[test]
fn busy_wait_zero_reports_busy_quickly() {
    let ledger = SimulatedLedger::new();
    let (_hub, wallet) = open_wallet(&ledger);
    let account = wallet.derive(&DerivationPath::ethereum(0), false).unwrap();

    ledger.hold();
    let signer = {
        let wallet = Arc::clone(&wallet);
        let account = account.clone();
        std::thread::spawn(move || wallet.sign_transaction(&account, &tx()))
    };
    assert!(ledger.wait_for_held(Duration::from_secs(2)));

    let err = wallet
        .derive(&DerivationPath::ethereum(1), false)
        .unwrap_err();
    assert!(matches!(err, Error::DeviceBusy));
    assert!(err.is_retryable());

    ledger.release();
    assert!(signer.join().unwrap().is_ok());
    assert!(wallet.derive(&DerivationPath::ethereum(1), false).is_ok());
}
