//! # Program Registry
//!
//! Maps program ids to instruction layouts. Built once at startup from the
//! built-in System/SPL Token layouts plus every `*.json` schema file in the
//! configured directory, then shared read-only with the decoder.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info};

use super::types::{InstructionKind, PipelineError, ProgramRef};

pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

/// Names for programs commonly seen in wallet activity, with or without a layout.
static KNOWN_PROGRAM_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (SYSTEM_PROGRAM_ID, "system"),
        (TOKEN_PROGRAM_ID, "spl_token"),
        (TOKEN_2022_PROGRAM_ID, "spl_token_2022"),
        ("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL", "associated_token_account"),
        ("ComputeBudget111111111111111111111111111111", "compute_budget"),
        ("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr", "memo"),
        ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "raydium_amm"),
        ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", "raydium_clmm"),
        ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "orca_whirlpool"),
        ("JUP2jxvXaqu7NQY1GmNF4m1vodw12LVXYxbFL2uJvfo", "jupiter_v2"),
        ("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", "jupiter_v6"),
        ("LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo", "meteora_dlmm"),
        ("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P", "pump_fun"),
    ])
});

/// Primitive argument encodings, all little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    U8,
    U16,
    U32,
    U64,
    U128,
    I64,
    Bool,
    Pubkey,
}

impl ArgType {
    fn width(&self) -> usize {
        match self {
            ArgType::U8 | ArgType::Bool => 1,
            ArgType::U16 => 2,
            ArgType::U32 => 4,
            ArgType::U64 | ArgType::I64 => 8,
            ArgType::U128 => 16,
            ArgType::Pubkey => 32,
        }
    }

    fn read(&self, bytes: &[u8]) -> Value {
        let mut buf = [0u8; 16];
        buf[..bytes.len().min(16)].copy_from_slice(&bytes[..bytes.len().min(16)]);
        match self {
            ArgType::U8 => json!(bytes[0]),
            ArgType::Bool => json!(bytes[0] != 0),
            ArgType::U16 => json!(u16::from_le_bytes([buf[0], buf[1]])),
            ArgType::U32 => json!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            // u64 and wider are emitted as strings so JSON consumers keep full precision
            ArgType::U64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf[..8]);
                json!(u64::from_le_bytes(b).to_string())
            }
            ArgType::I64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf[..8]);
                json!(i64::from_le_bytes(b).to_string())
            }
            ArgType::U128 => json!(u128::from_le_bytes(buf).to_string()),
            ArgType::Pubkey => json!(bs58::encode(bytes).into_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ArgType,
}

/// Where to find the two sides and the amount of a transfer-like instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLayout {
    pub source: usize,
    pub destination: usize,
    pub amount_arg: String,
    /// Account index holding the mint, for layouts that name it explicitly.
    #[serde(default)]
    pub mint_account: Option<usize>,
    /// Lamport transfer between system accounts.
    #[serde(default)]
    pub native: bool,
}

/// Account indices of the pool and its two reserve vaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLayout {
    pub pool: usize,
    pub vault_a: usize,
    pub vault_b: usize,
    /// Restricts the layout to instructions with exactly this many accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_count: Option<usize>,
}

// A schema file may give one layout or a list of account-count variants.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PoolLayouts {
    One(PoolLayout),
    Many(Vec<PoolLayout>),
}

impl From<PoolLayouts> for Vec<PoolLayout> {
    fn from(layouts: PoolLayouts) -> Self {
        match layouts {
            PoolLayouts::One(layout) => vec![layout],
            PoolLayouts::Many(layouts) => layouts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionSchema {
    pub name: String,
    pub discriminator: Vec<u8>,
    pub kind: InstructionKind,
    pub args: Vec<ArgSpec>,
    pub accounts: Vec<String>,
    pub transfer: Option<TransferLayout>,
    pub pool_layouts: Vec<PoolLayout>,
}

impl InstructionSchema {
    /// Layout pinned to `account_count`, else the first unpinned one.
    pub fn pool_layout(&self, account_count: usize) -> Option<&PoolLayout> {
        self.pool_layouts
            .iter()
            .find(|layout| layout.account_count == Some(account_count))
            .or_else(|| self.pool_layouts.iter().find(|layout| layout.account_count.is_none()))
    }

    /// Decodes the fixed-width arguments that follow the discriminator.
    /// Returns None when the data is too short for the layout.
    pub fn decode_args(&self, data: &[u8]) -> Option<BTreeMap<String, Value>> {
        let mut offset = self.discriminator.len();
        let mut out = BTreeMap::new();
        for arg in &self.args {
            let end = offset + arg.ty.width();
            let bytes = data.get(offset..end)?;
            out.insert(arg.name.clone(), arg.ty.read(bytes));
            offset = end;
        }
        Some(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSchema {
    pub program_id: String,
    pub name: String,
    pub instructions: Vec<InstructionSchema>,
}

impl ProgramSchema {
    /// Longest discriminator that prefixes `data`.
    pub fn match_instruction(&self, data: &[u8]) -> Option<&InstructionSchema> {
        self.instructions
            .iter()
            .filter(|ix| !ix.discriminator.is_empty() && data.starts_with(&ix.discriminator))
            .max_by_key(|ix| ix.discriminator.len())
    }
}

// On-disk form, discriminators as hex strings.
#[derive(Debug, Deserialize)]
struct SchemaFile {
    program_id: String,
    name: String,
    instructions: Vec<InstructionFile>,
}

#[derive(Debug, Deserialize)]
struct InstructionFile {
    name: String,
    discriminator: String,
    kind: InstructionKind,
    #[serde(default)]
    args: Vec<ArgSpec>,
    #[serde(default)]
    accounts: Vec<String>,
    #[serde(default)]
    transfer: Option<TransferLayout>,
    #[serde(default)]
    pool: Option<PoolLayouts>,
}

impl SchemaFile {
    fn into_schema(self) -> Result<ProgramSchema, String> {
        Pubkey::from_str(&self.program_id)
            .map_err(|e| format!("invalid program id {}: {}", self.program_id, e))?;

        let mut instructions = Vec::with_capacity(self.instructions.len());
        for ix in self.instructions {
            let discriminator = hex::decode(ix.discriminator.trim_start_matches("0x"))
                .map_err(|e| format!("instruction {}: bad discriminator: {}", ix.name, e))?;
            if discriminator.is_empty() {
                return Err(format!("instruction {}: empty discriminator", ix.name));
            }
            instructions.push(InstructionSchema {
                name: ix.name,
                discriminator,
                kind: ix.kind,
                args: ix.args,
                accounts: ix.accounts,
                transfer: ix.transfer,
                pool_layouts: ix.pool.map(Vec::from).unwrap_or_default(),
            });
        }

        Ok(ProgramSchema { program_id: self.program_id, name: self.name, instructions })
    }
}

/// Entry of the health surface's known-program listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownProgram {
    pub program_id: String,
    pub name: String,
    pub has_layout: bool,
}

#[derive(Debug, Clone)]
pub struct ProgramRegistry {
    programs: HashMap<String, ProgramSchema>,
}

impl ProgramRegistry {
    /// Registry holding only the built-in System and SPL Token layouts.
    pub fn builtin() -> Self {
        let mut programs = HashMap::new();
        for schema in [
            system_schema(),
            token_schema(TOKEN_PROGRAM_ID, "spl_token"),
            token_schema(TOKEN_2022_PROGRAM_ID, "spl_token_2022"),
        ] {
            programs.insert(schema.program_id.clone(), schema);
        }
        Self { programs }
    }

    /// Built-ins plus every `*.json` schema in `dir`. A missing directory is
    /// not an error; an unreadable or invalid file is.
    pub fn load_dir(dir: &Path) -> Result<Self, PipelineError> {
        let mut registry = Self::builtin();
        if !dir.exists() {
            info!("📂 Schema directory {} not found, using built-in layouts only", dir.display());
            return Ok(registry);
        }

        let entries = fs::read_dir(dir).map_err(|e| {
            PipelineError::Configuration(format!("cannot read schema dir {}: {}", dir.display(), e))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut seen = HashSet::new();
        for path in paths {
            let raw = fs::read_to_string(&path).map_err(|e| {
                PipelineError::Configuration(format!("cannot read {}: {}", path.display(), e))
            })?;
            let file: SchemaFile = serde_json::from_str(&raw).map_err(|e| {
                PipelineError::Configuration(format!("invalid schema {}: {}", path.display(), e))
            })?;
            let schema = file
                .into_schema()
                .map_err(|e| PipelineError::Configuration(format!("{}: {}", path.display(), e)))?;
            if !seen.insert(schema.program_id.clone()) {
                return Err(PipelineError::Configuration(format!(
                    "program {} registered twice ({})",
                    schema.program_id,
                    path.display()
                )));
            }
            registry.register(schema);
            debug!("Loaded schema {}", path.display());
        }

        info!("📚 Program registry loaded with {} layouts", registry.programs.len());
        Ok(registry)
    }

    /// Inserts or replaces the layout for a program.
    pub fn register(&mut self, schema: ProgramSchema) {
        self.programs.insert(schema.program_id.clone(), schema);
    }

    pub fn lookup(&self, program_id: &str) -> Option<&ProgramSchema> {
        self.programs.get(program_id)
    }

    /// Resolution order: registered layout, then the static name table.
    pub fn resolve(&self, program_id: &str) -> ProgramRef {
        if let Some(schema) = self.programs.get(program_id) {
            return ProgramRef::Known { name: schema.name.clone() };
        }
        match KNOWN_PROGRAM_NAMES.get(program_id) {
            Some(name) => ProgramRef::Known { name: name.to_string() },
            None => ProgramRef::Unknown,
        }
    }

    pub fn known_programs(&self) -> Vec<KnownProgram> {
        let mut out: BTreeMap<String, KnownProgram> = KNOWN_PROGRAM_NAMES
            .iter()
            .map(|(id, name)| {
                (id.to_string(), KnownProgram {
                    program_id: id.to_string(),
                    name: name.to_string(),
                    has_layout: false,
                })
            })
            .collect();
        for schema in self.programs.values() {
            out.insert(schema.program_id.clone(), KnownProgram {
                program_id: schema.program_id.clone(),
                name: schema.name.clone(),
                has_layout: true,
            });
        }
        out.into_values().collect()
    }
}

fn ix(
    name: &str,
    discriminator: Vec<u8>,
    kind: InstructionKind,
    args: &[(&str, ArgType)],
    accounts: &[&str],
) -> InstructionSchema {
    InstructionSchema {
        name: name.to_string(),
        discriminator,
        kind,
        args: args.iter().map(|(n, t)| ArgSpec { name: n.to_string(), ty: *t }).collect(),
        accounts: accounts.iter().map(|a| a.to_string()).collect(),
        transfer: None,
        pool_layouts: Vec::new(),
    }
}

fn system_schema() -> ProgramSchema {
    use ArgType::*;
    use InstructionKind::{Other, Transfer};

    let d = |n: u32| n.to_le_bytes().to_vec();
    let mut transfer = ix("transfer", d(2), Transfer, &[("lamports", U64)], &["from", "to"]);
    transfer.transfer = Some(TransferLayout {
        source: 0,
        destination: 1,
        amount_arg: "lamports".to_string(),
        mint_account: None,
        native: true,
    });
    let mut transfer_with_seed =
        ix("transfer_with_seed", d(11), Transfer, &[("lamports", U64)], &["from", "base", "to"]);
    transfer_with_seed.transfer = Some(TransferLayout {
        source: 0,
        destination: 2,
        amount_arg: "lamports".to_string(),
        mint_account: None,
        native: true,
    });

    ProgramSchema {
        program_id: SYSTEM_PROGRAM_ID.to_string(),
        name: "system".to_string(),
        instructions: vec![
            ix(
                "create_account",
                d(0),
                Other,
                &[("lamports", U64), ("space", U64), ("owner", ArgType::Pubkey)],
                &["from", "new_account"],
            ),
            ix("assign", d(1), Other, &[("owner", ArgType::Pubkey)], &["account"]),
            transfer,
            // seed is length-prefixed, only the discriminator is matched
            ix("create_account_with_seed", d(3), Other, &[], &["from", "new_account", "base"]),
            ix("advance_nonce_account", d(4), Other, &[], &["nonce", "recent_blockhashes", "authority"]),
            ix("withdraw_nonce_account", d(5), Other, &[("lamports", U64)], &["nonce", "to"]),
            ix("initialize_nonce_account", d(6), Other, &[("authority", ArgType::Pubkey)], &["nonce"]),
            ix("authorize_nonce_account", d(7), Other, &[("authority", ArgType::Pubkey)], &["nonce", "authority"]),
            ix("allocate", d(8), Other, &[("space", U64)], &["account"]),
            ix("allocate_with_seed", d(9), Other, &[], &["account", "base"]),
            ix("assign_with_seed", d(10), Other, &[], &["account", "base"]),
            transfer_with_seed,
            ix("upgrade_nonce_account", d(12), Other, &[], &["nonce"]),
        ],
    }
}

fn token_schema(program_id: &str, name: &str) -> ProgramSchema {
    use ArgType::*;
    use InstructionKind::{Other, Transfer};

    let mut transfer =
        ix("transfer", vec![3], Transfer, &[("amount", U64)], &["source", "destination", "authority"]);
    transfer.transfer = Some(TransferLayout {
        source: 0,
        destination: 1,
        amount_arg: "amount".to_string(),
        mint_account: None,
        native: false,
    });
    let mut transfer_checked = ix(
        "transfer_checked",
        vec![12],
        Transfer,
        &[("amount", U64), ("decimals", U8)],
        &["source", "mint", "destination", "authority"],
    );
    transfer_checked.transfer = Some(TransferLayout {
        source: 0,
        destination: 2,
        amount_arg: "amount".to_string(),
        mint_account: Some(1),
        native: false,
    });

    ProgramSchema {
        program_id: program_id.to_string(),
        name: name.to_string(),
        instructions: vec![
            ix("initialize_mint", vec![0], Other, &[("decimals", U8), ("mint_authority", ArgType::Pubkey)], &["mint", "rent"]),
            ix("initialize_account", vec![1], Other, &[], &["account", "mint", "owner", "rent"]),
            ix("initialize_multisig", vec![2], Other, &[("m", U8)], &["multisig", "rent"]),
            transfer,
            ix("approve", vec![4], Other, &[("amount", U64)], &["source", "delegate", "owner"]),
            ix("revoke", vec![5], Other, &[], &["source", "owner"]),
            ix("set_authority", vec![6], Other, &[("authority_type", U8)], &["account", "current_authority"]),
            ix("mint_to", vec![7], Other, &[("amount", U64)], &["mint", "account", "authority"]),
            ix("burn", vec![8], Other, &[("amount", U64)], &["account", "mint", "authority"]),
            ix("close_account", vec![9], Other, &[], &["account", "destination", "owner"]),
            ix("freeze_account", vec![10], Other, &[], &["account", "mint", "authority"]),
            ix("thaw_account", vec![11], Other, &[], &["account", "mint", "authority"]),
            transfer_checked,
            ix(
                "approve_checked",
                vec![13],
                Other,
                &[("amount", U64), ("decimals", U8)],
                &["source", "mint", "delegate", "owner"],
            ),
            ix("mint_to_checked", vec![14], Other, &[("amount", U64), ("decimals", U8)], &["mint", "account", "authority"]),
            ix("burn_checked", vec![15], Other, &[("amount", U64), ("decimals", U8)], &["account", "mint", "authority"]),
            ix("initialize_account2", vec![16], Other, &[("owner", ArgType::Pubkey)], &["account", "mint", "rent"]),
            ix("sync_native", vec![17], Other, &[], &["account"]),
            ix("initialize_account3", vec![18], Other, &[("owner", ArgType::Pubkey)], &["account", "mint"]),
            ix("initialize_mint2", vec![20], Other, &[("decimals", U8), ("mint_authority", ArgType::Pubkey)], &["mint"]),
        ],
    }
}
