//! Generate a 2-of-3 testnet P2SH address for testing
//! Run with: cargo run --example testnet_address

use bitcoin::{Address, Network};
use coindb_core::account::DEFAULT_BIN;
use coindb_core::{derive_seed, generate_mnemonic, Wallet};

fn main() {
    let mut wallet = Wallet::new();

    println!("=== TESTNET MULTISIG ===\n");
    for name in ["alice", "bob", "carol"] {
        let mnemonic = generate_mnemonic(12).unwrap();
        println!("{name}: {mnemonic}");
        let seed = derive_seed(&mnemonic, "");
        wallet.new_keychain(name, &seed[..]).unwrap();
    }

    let account = wallet
        .new_account("demo", 2, &["alice", "bob", "carol"], 5, 0)
        .unwrap();
    let issued = wallet.issue_script(account, DEFAULT_BIN, "faucet").unwrap();
    let script = wallet.script(issued).unwrap();

    let address = Address::from_script(script.txoutscript(), Network::Testnet).unwrap();
    println!("\nAddress (bin @default, index {}): {}", script.index(), address);
    println!("Redeem via: {}", script.txinscript().to_asm_string());
}
