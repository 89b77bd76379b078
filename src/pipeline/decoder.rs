//! # Instruction Decoder
//!
//! Turns a `getTransaction` JSON payload into a [`Transaction`]. Decoding is
//! per instruction: an instruction the registry cannot explain is kept as an
//! opaque entry instead of failing the transaction. Only a malformed envelope
//! (bad JSON, missing signature, out-of-range account index, bad base58)
//! fails the whole transaction.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use solana_sdk::signature::Signature;
use tracing::debug;

use super::registry::{PoolLayout, ProgramRegistry, TransferLayout};
use super::types::{
    DecodedInstruction, InstructionKind, NATIVE_SOL_MINT, PipelineError, PoolObservation,
    ProgramRef, RawEvent, Transaction, TxStatus,
};

const LAMPORT_DECIMALS: u32 = 9;

// ============================================================================
// RPC ENVELOPE
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    slot: u64,
    #[serde(default)]
    block_time: Option<i64>,
    transaction: RpcTransactionBody,
    #[serde(default)]
    meta: Option<RpcMeta>,
}

#[derive(Debug, Deserialize)]
struct RpcTransactionBody {
    signatures: Vec<String>,
    message: RpcMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMessage {
    account_keys: Vec<AccountKey>,
    instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AccountKey {
    Plain(String),
    Parsed { pubkey: String },
}

impl AccountKey {
    fn into_string(self) -> String {
        match self {
            AccountKey::Plain(key) => key,
            AccountKey::Parsed { pubkey } => pubkey,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcInstruction {
    program_id_index: usize,
    #[serde(default)]
    accounts: Vec<usize>,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    inner_instructions: Option<Vec<RpcInnerInstructions>>,
    #[serde(default)]
    pre_token_balances: Option<Vec<RpcTokenBalance>>,
    #[serde(default)]
    post_token_balances: Option<Vec<RpcTokenBalance>>,
    #[serde(default)]
    loaded_addresses: Option<RpcLoadedAddresses>,
}

#[derive(Debug, Deserialize)]
struct RpcInnerInstructions {
    index: usize,
    instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTokenBalance {
    account_index: usize,
    mint: String,
    #[serde(default)]
    owner: Option<String>,
    ui_token_amount: RpcUiTokenAmount,
}

#[derive(Debug, Deserialize)]
struct RpcUiTokenAmount {
    amount: String,
    decimals: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RpcLoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}

// ============================================================================
// TOKEN ACCOUNTS
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TokenAccount {
    mint: String,
    owner: Option<String>,
    decimals: u32,
    pre: Option<Decimal>,
    post: Option<Decimal>,
}

type TokenAccounts = HashMap<String, TokenAccount>;

fn scale_amount(raw: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(raw as i128, decimals.min(28)).normalize()
}

fn index_token_balances(keys: &[String], meta: &RpcMeta) -> Result<TokenAccounts, PipelineError> {
    let mut accounts = TokenAccounts::new();
    let sides = [(&meta.pre_token_balances, true), (&meta.post_token_balances, false)];
    for (balances, is_pre) in sides {
        for balance in balances.iter().flatten() {
            let key = keys.get(balance.account_index).ok_or_else(|| {
                PipelineError::Decode(format!("token balance index {} out of range", balance.account_index))
            })?;
            let raw: u64 = balance.ui_token_amount.amount.parse().map_err(|_| {
                PipelineError::Decode(format!("bad token amount {}", balance.ui_token_amount.amount))
            })?;
            let amount = scale_amount(raw, balance.ui_token_amount.decimals);

            let entry = accounts.entry(key.clone()).or_default();
            entry.mint = balance.mint.clone();
            entry.decimals = balance.ui_token_amount.decimals;
            if balance.owner.is_some() {
                entry.owner = balance.owner.clone();
            }
            if is_pre {
                entry.pre = Some(amount);
            } else {
                entry.post = Some(amount);
            }
        }
    }
    Ok(accounts)
}

// ============================================================================
// DECODER
// ============================================================================

pub struct Decoder {
    registry: Arc<ProgramRegistry>,
    wallet: String,
}

impl Decoder {
    pub fn new(registry: Arc<ProgramRegistry>, wallet: impl Into<String>) -> Self {
        Self { registry, wallet: wallet.into() }
    }

    pub fn decode(&self, event: &RawEvent) -> Result<Transaction, PipelineError> {
        let rpc: RpcTransaction = serde_json::from_slice(&event.payload).map_err(|e| {
            PipelineError::Decode(format!("event {}: {}", event.source_sequence_id, e))
        })?;
        self.decode_rpc(rpc, event.received_at)
    }

    fn decode_rpc(
        &self,
        rpc: RpcTransaction,
        received_at: DateTime<Utc>,
    ) -> Result<Transaction, PipelineError> {
        let signature = rpc
            .transaction
            .signatures
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Decode("transaction has no signature".to_string()))?;
        Signature::from_str(&signature)
            .map_err(|e| PipelineError::Decode(format!("invalid signature {}: {}", signature, e)))?;

        let meta = rpc.meta.unwrap_or_default();
        let mut keys: Vec<String> =
            rpc.transaction.message.account_keys.into_iter().map(AccountKey::into_string).collect();
        if let Some(loaded) = &meta.loaded_addresses {
            keys.extend(loaded.writable.iter().cloned());
            keys.extend(loaded.readonly.iter().cloned());
        }
        let fee_payer = keys
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::Decode(format!("{}: no account keys", signature)))?;

        let tokens = index_token_balances(&keys, &meta)?;

        let mut inner_by_parent: HashMap<usize, &Vec<RpcInstruction>> = HashMap::new();
        for set in meta.inner_instructions.iter().flatten() {
            inner_by_parent.insert(set.index, &set.instructions);
        }

        let mut instructions = Vec::with_capacity(rpc.transaction.message.instructions.len());
        for (index, raw) in rpc.transaction.message.instructions.iter().enumerate() {
            let mut decoded = self.decode_instruction(raw, &keys, &tokens)?;

            // DEX calls move tokens through inner transfers and, for aggregators,
            // through inner pool swaps; attribute both to the parent
            if decoded.kind.touches_pool() {
                if let Some(inner) = inner_by_parent.get(&index) {
                    for raw_inner in inner.iter() {
                        let child = self.decode_instruction(raw_inner, &keys, &tokens)?;
                        if child.kind == InstructionKind::Transfer {
                            for (mint, delta) in child.amounts {
                                *decoded.amounts.entry(mint).or_default() += delta;
                            }
                        } else {
                            for observation in child.pool_observations() {
                                let seen = decoded.pool.as_ref() == Some(observation)
                                    || decoded.routed_pools.contains(observation);
                                if !seen {
                                    decoded.routed_pools.push(observation.clone());
                                }
                            }
                        }
                    }
                    decoded.amounts.retain(|_, delta| !delta.is_zero());
                }
            }
            instructions.push(decoded);
        }

        self.fill_single_swap_from_balances(&mut instructions, &tokens);

        let block_time = rpc
            .block_time
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(received_at);
        let status = if meta.err.is_none() { TxStatus::Success } else { TxStatus::Failed };

        Ok(Transaction { signature, slot: rpc.slot, block_time, fee_payer, instructions, status })
    }

    fn decode_instruction(
        &self,
        raw: &RpcInstruction,
        keys: &[String],
        tokens: &TokenAccounts,
    ) -> Result<DecodedInstruction, PipelineError> {
        let program_id = keys
            .get(raw.program_id_index)
            .cloned()
            .ok_or_else(|| PipelineError::Decode(format!("program index {} out of range", raw.program_id_index)))?;
        let accounts = raw
            .accounts
            .iter()
            .map(|i| {
                keys.get(*i)
                    .cloned()
                    .ok_or_else(|| PipelineError::Decode(format!("account index {} out of range", i)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let data = bs58::decode(&raw.data)
            .into_vec()
            .map_err(|e| PipelineError::Decode(format!("instruction data is not base58: {}", e)))?;

        let program = self.registry.resolve(&program_id);
        let matched = self
            .registry
            .lookup(&program_id)
            .and_then(|schema| schema.match_instruction(&data));

        let Some(schema) = matched else {
            return Ok(opaque(program_id, program, accounts, &data));
        };
        let Some(args) = schema.decode_args(&data) else {
            debug!("{} data too short for {}, keeping opaque", program.name(), schema.name);
            return Ok(opaque(program_id, program, accounts, &data));
        };

        let mut amounts = BTreeMap::new();
        if let Some(layout) = &schema.transfer {
            if let Some((mint, delta)) = self.transfer_delta(layout, &args, &accounts, tokens) {
                if !delta.is_zero() {
                    amounts.insert(mint, delta);
                }
            }
        }
        let pool = schema
            .pool_layout(accounts.len())
            .and_then(|layout| pool_observation(layout, &accounts, tokens));

        Ok(DecodedInstruction {
            program_id,
            program,
            instruction_name: schema.name.clone(),
            kind: schema.kind,
            accounts,
            args,
            amounts,
            pool,
            routed_pools: Vec::new(),
            opaque_data: None,
        })
    }

    /// Signed amount moved relative to the monitored wallet.
    fn transfer_delta(
        &self,
        layout: &TransferLayout,
        args: &BTreeMap<String, Value>,
        accounts: &[String],
        tokens: &TokenAccounts,
    ) -> Option<(String, Decimal)> {
        let raw = value_as_u64(args.get(&layout.amount_arg)?)?;
        let source = accounts.get(layout.source)?;
        let destination = accounts.get(layout.destination)?;

        let (mint, decimals, from_owner, to_owner) = if layout.native {
            (NATIVE_SOL_MINT.to_string(), LAMPORT_DECIMALS, Some(source.clone()), Some(destination.clone()))
        } else {
            let from = tokens.get(source);
            let to = tokens.get(destination);
            let mint = layout
                .mint_account
                .and_then(|i| accounts.get(i).cloned())
                .or_else(|| from.map(|t| t.mint.clone()))
                .or_else(|| to.map(|t| t.mint.clone()))?;
            let decimals = from
                .or(to)
                .map(|t| t.decimals)
                .or_else(|| args.get("decimals").and_then(value_as_u64).map(|d| d as u32))?;
            (mint, decimals, from.and_then(|t| t.owner.clone()), to.and_then(|t| t.owner.clone()))
        };

        let amount = scale_amount(raw, decimals);
        let mut delta = Decimal::ZERO;
        if from_owner.as_deref() == Some(self.wallet.as_str()) {
            delta -= amount;
        }
        if to_owner.as_deref() == Some(self.wallet.as_str()) {
            delta += amount;
        }
        Some((mint, delta))
    }

    /// A lone swap without inner transfers takes the wallet's token balance
    /// changes as its amounts.
    fn fill_single_swap_from_balances(&self, instructions: &mut [DecodedInstruction], tokens: &TokenAccounts) {
        let mut swaps = instructions.iter_mut().filter(|ix| ix.kind == InstructionKind::Swap);
        let (Some(swap), None) = (swaps.next(), swaps.next()) else {
            return;
        };
        if !swap.amounts.is_empty() {
            return;
        }

        let mut deltas: BTreeMap<String, Decimal> = BTreeMap::new();
        for account in tokens.values() {
            if account.owner.as_deref() != Some(self.wallet.as_str()) {
                continue;
            }
            let change = account.post.unwrap_or_default() - account.pre.unwrap_or_default();
            *deltas.entry(account.mint.clone()).or_default() += change;
        }
        deltas.retain(|_, d| !d.is_zero());
        swap.amounts = deltas;
    }
}

fn opaque(program_id: String, program: ProgramRef, accounts: Vec<String>, data: &[u8]) -> DecodedInstruction {
    let (instruction_name, kind) = if program.is_known() {
        ("unrecognized", InstructionKind::Other)
    } else {
        ("unknown", InstructionKind::Unknown)
    };
    DecodedInstruction {
        program_id,
        program,
        instruction_name: instruction_name.to_string(),
        kind,
        accounts,
        args: BTreeMap::new(),
        amounts: BTreeMap::new(),
        pool: None,
        routed_pools: Vec::new(),
        opaque_data: Some(BASE64.encode(data)),
    }
}

fn pool_observation(layout: &PoolLayout, accounts: &[String], tokens: &TokenAccounts) -> Option<PoolObservation> {
    let address = accounts.get(layout.pool)?.clone();
    let vault_a = tokens.get(accounts.get(layout.vault_a)?)?;
    let vault_b = tokens.get(accounts.get(layout.vault_b)?)?;
    Some(PoolObservation {
        address,
        token_a: vault_a.mint.clone(),
        token_b: vault_b.mint.clone(),
        reserve_a: vault_a.post?,
        reserve_b: vault_b.post?,
    })
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
