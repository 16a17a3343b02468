//! Ledger EVM Signer CLI Example
//!
//! Drives a USB-connected Ledger running the Ethereum app through the
//! HID transport.
//!
//! # Prerequisites
//!
//! - A Ledger Nano S, Nano S Plus, Nano X, Stax or Flex, unlocked
//! - The Ethereum app open on the device
//! - On Linux, udev rules granting access to vendor `2c97`
//!
//! # Quick Start
//!
//! ```bash
//! cargo run --example ledger-cli -p ledger-evm-signer-core --features hidapi -- list
//! cargo run --example ledger-cli -p ledger-evm-signer-core --features hidapi -- address
//! cargo run --example ledger-cli -p ledger-evm-signer-core --features hidapi -- sign-tx tx.json
//! ```
//!
//! Set `RUST_LOG=ledger_evm_signer_core=debug` to trace every exchange.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `list` | List connected Ledgers and their app version |
//! | `address [path] [--display]` | Derive an address, optionally confirming on screen |
//! | `sign-tx <file> [path]` | Sign a JSON transaction |
//! | `sign-typed <file> [path]` | Sign a JSON EIP-712 document |
//!
//! The default path is `m/44'/60'/0'/0/0`.
//!
//! # Files
//!
//! A transaction file looks like:
//!
//! ```json
//! {
//!   "nonce": "0x3", "gasPrice": "0x4a817c800", "gasLimit": "0x5208",
//!   "to": "0x3535353535353535353535353535353535353535",
//!   "value": "0xde0b6b3a7640000", "data": "0x", "chainId": "0x1"
//! }
//! ```
//!
//! A typed-data file is the usual `eth_signTypedData_v4` document with
//! `types`, `primaryType`, `domain` and `message`.

#![expect(unused_crate_dependencies, reason = "needed for CLI example")]

use std::env;
use std::error::Error;
use std::fs;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use ledger_evm_signer_core::{
    DerivationPath, HidBackend, Hub, HubConfig, LedgerWallet, Result, TypedData,
    UnsignedTransaction,
};

type CliResult = core::result::Result<(), Box<dyn Error>>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return;
    }

    let result = match args[1].as_str() {
        "list" => cmd_list(),
        "address" => cmd_address(&args[2..]),
        "sign-tx" => cmd_sign_tx(&args[2..]),
        "sign-typed" => cmd_sign_typed(&args[2..]),
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!(
        r#"Ledger EVM Signer CLI

USAGE:
    ledger-cli <COMMAND>

COMMANDS:
    list                          List connected Ledgers
    address [path] [--display]    Derive an address (default m/44'/60'/0'/0/0)
    sign-tx <file> [path]         Sign the JSON transaction in <file>
    sign-typed <file> [path]      Sign the EIP-712 document in <file>
    help                          Show this help message

ENVIRONMENT:
    LEDGER_HUB_CONFIG             JSON hub configuration, e.g. {{"busyWaitMs": 5000}}
    RUST_LOG                      Log filter, e.g. ledger_evm_signer_core=debug
"#
    );
}

fn hub() -> Result<Hub> {
    let config = match env::var("LEDGER_HUB_CONFIG") {
        Ok(json) => HubConfig::from_json(&json)?,
        Err(_) => HubConfig::default(),
    };
    Hub::new(Arc::new(HidBackend::new()?), config)
}

/// Opens the first Ledger found.
fn first_wallet(hub: &Hub) -> Result<Arc<LedgerWallet>> {
    let wallet = hub.wallet(0)?;
    wallet.open()?;
    Ok(wallet)
}

fn path_arg(arg: Option<&String>) -> Result<DerivationPath> {
    arg.map_or_else(|| Ok(DerivationPath::ethereum(0)), |s| s.parse())
}

fn cmd_list() -> CliResult {
    let hub = hub()?;
    let wallets = hub.wallets();

    if wallets.is_empty() {
        println!("No Ledger devices found.");
        return Ok(());
    }

    for (index, wallet) in wallets.iter().enumerate() {
        let info = wallet.info();
        let product = info.product.as_deref().unwrap_or("Ledger");
        match wallet.open() {
            Ok(()) => println!("  [{index}] {product} ({}): {}", info.path, wallet.status()),
            Err(e) => println!("  [{index}] {product} ({}): {e}", info.path),
        }
        wallet.close();
    }

    Ok(())
}

fn cmd_address(args: &[String]) -> CliResult {
    let display = args.iter().any(|a| a == "--display");
    let path = path_arg(args.iter().find(|a| !a.starts_with("--")))?;

    let hub = hub()?;
    let wallet = first_wallet(&hub)?;

    if display {
        println!("Confirm the address on the device...");
    }
    let account = wallet.derive(&path, display)?;

    println!("Path:       {}", account.path);
    println!("Address:    {}", account.address);
    println!("Public key: {}", account.public_key);

    wallet.close();
    Ok(())
}

fn cmd_sign_tx(args: &[String]) -> CliResult {
    let Some(file) = args.first() else {
        eprintln!("Usage: ledger-cli sign-tx <file> [path]");
        return Ok(());
    };
    let tx = UnsignedTransaction::from_json(&fs::read_to_string(file)?)?;
    let path = path_arg(args.get(1))?;

    let hub = hub()?;
    let wallet = first_wallet(&hub)?;
    let account = wallet.derive(&path, false)?;

    println!("Signing as {} ({})", account.address, account.path);
    println!("Signing hash: {}", tx.signing_hash());
    println!("Review and approve on the device...");

    let signed = wallet.sign_transaction(&account, &tx)?;

    println!("Signature:  {}", signed.signature);
    println!("Tx hash:    {}", signed.hash());
    println!("Raw tx:     0x{}", hex::encode(signed.encoded()));

    wallet.close();
    Ok(())
}

fn cmd_sign_typed(args: &[String]) -> CliResult {
    let Some(file) = args.first() else {
        eprintln!("Usage: ledger-cli sign-typed <file> [path]");
        return Ok(());
    };
    let typed_data = TypedData::from_json(&fs::read_to_string(file)?)?;
    let path = path_arg(args.get(1))?;

    let hub = hub()?;
    let wallet = first_wallet(&hub)?;
    let account = wallet.derive(&path, false)?;

    println!("Signing as {} ({})", account.address, account.path);
    println!("Domain hash:  {}", typed_data.domain_hash()?);
    println!("Message hash: {}", typed_data.message_hash()?);
    println!("Review and approve on the device...");

    let signature = wallet.sign_typed_data(&account, &typed_data)?;
    println!("Signature:    {signature}");

    wallet.close();
    Ok(())
}
