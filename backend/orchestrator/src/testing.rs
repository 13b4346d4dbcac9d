//! In-memory ledger for tests.
//!
//! [`FakeLedger`] models just enough of the securitization contracts to drive
//! the workflow end to end: a mintable stablecoin, the loan registry, the
//! pool and its tranche token. Calls are confirmed the moment they are
//! submitted unless receipts are delayed. Nonces are enforced strictly per
//! identity, so a wrong nonce is rejected at submission.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::Config;
use crate::errors::{OrchestratorError, Result};
use crate::ledger::{as_address, as_array, as_bool, as_i64, as_u128, as_u32, as_u64, Address, Ledger, LedgerCall, LogEntry, Receipt};
use crate::sequencer::ReceiptTiming;

pub const OPERATOR: &str = "0x00000000000000000000000000000000000000a1";
pub const INVESTOR: &str = "0x00000000000000000000000000000000000000b2";

pub fn fast_timing() -> ReceiptTiming {
    ReceiptTiming {
        timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(1),
    }
}

/// Default configuration pointed at the fake's identities.
pub fn test_config() -> Config {
    let mut config = Config::from_lookup(|key| match key {
        "OPERATOR_ADDRESS" => Some(OPERATOR.to_string()),
        "INVESTOR_ADDRESS" => Some(INVESTOR.to_string()),
        _ => None,
    })
    .unwrap();
    config.receipt_timing = fast_timing();
    config
}

pub fn addr(raw: &str) -> Address {
    Address::parse(raw).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTx {
    pub from: Address,
    pub nonce: u64,
    pub call: LedgerCall,
}

#[derive(Default)]
struct Token {
    balances: HashMap<Address, u128>,
    allowances: HashMap<(Address, Address), u128>,
}

#[derive(Default)]
struct Registry {
    /// (principal, rate bps, maturity ms), indexed by token id.
    loans: Vec<(u128, u32, i64)>,
}

#[derive(Default)]
struct PoolTranche {
    loan_ids: Vec<u64>,
    notional: u128,
    rate_bps: u32,
    investors: Vec<Address>,
    holdings: HashMap<Address, u128>,
    payments: u128,
}

impl PoolTranche {
    fn interest_on(&self, held: u128) -> u128 {
        held * u128::from(self.rate_bps) / 10_000
    }
}

struct Pool {
    registry: Address,
    stablecoin: Address,
    tranche_token: Address,
    tranches: BTreeMap<u64, PoolTranche>,
}

#[derive(Default)]
struct TrancheToken {
    balances: HashMap<(Address, u64), u128>,
    approvals: HashSet<(Address, Address)>,
}

enum Contract {
    Token(Token),
    Registry(Registry),
    Pool(Pool),
    TrancheToken(TrancheToken),
}

struct PendingReceipt {
    polls_left: u32,
    receipt: Receipt,
}

#[derive(Default)]
struct State {
    nonces: HashMap<Address, u64>,
    submitted: Vec<SubmittedTx>,
    receipts: HashMap<String, PendingReceipt>,
    contracts: HashMap<Address, Contract>,
    next_contract: u64,
    /// Method → successful calls still allowed before it starts reverting.
    reverts: HashMap<String, usize>,
    suppressed: HashSet<String>,
    receipt_delay: u32,
}

type Outcome = std::result::Result<(Option<Address>, Vec<LogEntry>), String>;

impl State {
    fn allocate_address(&mut self) -> Address {
        self.next_contract += 1;
        addr(&format!("0x{:040x}", 0x1000 + self.next_contract))
    }

    fn token_mut(&mut self, at: &Address) -> std::result::Result<&mut Token, String> {
        match self.contracts.get_mut(at) {
            Some(Contract::Token(token)) => Ok(token),
            _ => Err(format!("no stablecoin at {at}")),
        }
    }

    fn execute(&mut self, from: &Address, call: &LedgerCall) -> Outcome {
        if let Some(passes) = self.reverts.get_mut(call.method()) {
            if *passes == 0 {
                return Err(format!("forced revert of {}", call.method()));
            }
            *passes -= 1;
        }
        match call {
            LedgerCall::Deploy { artifact, args } => self.deploy(artifact, args),
            LedgerCall::Invoke {
                contract,
                method,
                args,
            } => {
                let logs = self.invoke(from, contract, method, args)?;
                Ok((None, logs))
            }
        }
    }

    fn deploy(&mut self, artifact: &str, args: &[Value]) -> Outcome {
        let contract = match artifact {
            "MockERC20" => Contract::Token(Token::default()),
            "LoanNFT" => Contract::Registry(Registry::default()),
            "Pool" => {
                let registry = arg_address(args, 0)?;
                let stablecoin = arg_address(args, 1)?;
                let tranche_token = self.allocate_address();
                self.contracts
                    .insert(tranche_token.clone(), Contract::TrancheToken(TrancheToken::default()));
                Contract::Pool(Pool {
                    registry,
                    stablecoin,
                    tranche_token,
                    tranches: BTreeMap::new(),
                })
            }
            other => return Err(format!("unknown artifact {other}")),
        };
        let address = self.allocate_address();
        self.contracts.insert(address.clone(), contract);
        Ok((Some(address), Vec::new()))
    }

    fn invoke(&mut self, from: &Address, at: &Address, method: &str, args: &[Value]) -> std::result::Result<Vec<LogEntry>, String> {
        let suppressed = |name: &str, log: LogEntry, state: &State| {
            if state.suppressed.contains(name) {
                Vec::new()
            } else {
                vec![log]
            }
        };

        match (self.contracts.get_mut(at), method) {
            (Some(Contract::Token(token)), "mint") => {
                let to = arg_address(args, 0)?;
                let amount = arg_u128(args, 1)?;
                *token.balances.entry(to).or_default() += amount;
                Ok(Vec::new())
            }
            (Some(Contract::Token(token)), "approve") => {
                let spender = arg_address(args, 0)?;
                let amount = arg_u128(args, 1)?;
                token.allowances.insert((from.clone(), spender), amount);
                Ok(Vec::new())
            }
            (Some(Contract::Registry(registry)), "mint") => {
                let _to = arg_address(args, 0)?;
                let principal = arg_u128(args, 1)?;
                let rate = as_u32(arg(args, 2)?, "rate").map_err(|e| e.to_string())?;
                let maturity = as_i64(arg(args, 3)?, "maturity").map_err(|e| e.to_string())?;
                let token_id = registry.loans.len() as u64;
                registry.loans.push((principal, rate, maturity));
                let log = LogEntry {
                    address: at.clone(),
                    event: "LoanMinted".to_string(),
                    args: json!({ "tokenId": token_id.to_string() }),
                };
                Ok(suppressed("LoanMinted", log, &*self))
            }
            (Some(Contract::Pool(pool)), "createTranche") => {
                let class = arg_u64(args, 0)?;
                let loan_ids = as_array(arg(args, 1)?, "ids")
                    .and_then(|ids| ids.iter().map(|v| as_u64(v, "id")).collect::<Result<Vec<_>>>())
                    .map_err(|e| e.to_string())?;
                let notional = arg_u128(args, 2)?;
                let rate_bps = as_u32(arg(args, 3)?, "bps").map_err(|e| e.to_string())?;
                if pool.tranches.contains_key(&class) {
                    return Err(format!("tranche {class} already exists"));
                }
                pool.tranches.insert(
                    class,
                    PoolTranche {
                        loan_ids,
                        notional,
                        rate_bps,
                        ..PoolTranche::default()
                    },
                );
                Ok(Vec::new())
            }
            (Some(Contract::Pool(_)), "invest") => {
                let class = arg_u64(args, 0)?;
                let amount = arg_u128(args, 2)?;
                self.pull_stablecoin(from, at, amount)?;
                let (token_address, pool) = self.pool_mut(at)?;
                let tranche = pool
                    .tranches
                    .get_mut(&class)
                    .ok_or_else(|| format!("tranche {class} does not exist"))?;
                if !tranche.investors.contains(from) {
                    tranche.investors.push(from.clone());
                }
                *tranche.holdings.entry(from.clone()).or_default() += amount;
                if let Some(Contract::TrancheToken(tt)) = self.contracts.get_mut(&token_address) {
                    *tt.balances.entry((from.clone(), class)).or_default() += amount;
                }
                Ok(Vec::new())
            }
            (Some(Contract::Pool(_)), "depositPayment") => {
                let class = arg_u64(args, 0)?;
                let series = arg_u64(args, 1)?;
                let amount = arg_u128(args, 2)?;
                self.pull_stablecoin(from, at, amount)?;
                let (_, pool) = self.pool_mut(at)?;
                let tranche = pool
                    .tranches
                    .get_mut(&class)
                    .ok_or_else(|| format!("tranche {class} does not exist"))?;
                tranche.payments += amount;
                Ok(vec![LogEntry {
                    address: at.clone(),
                    event: "PaymentDeposited".to_string(),
                    args: json!({ "classId": class, "seriesId": series, "amount": amount.to_string() }),
                }])
            }
            (Some(Contract::Pool(pool)), "distributePayments") => {
                let class = arg_u64(args, 0)?;
                let token_address = pool.tranche_token.clone();
                let tranche = pool
                    .tranches
                    .get(&class)
                    .ok_or_else(|| format!("tranche {class} does not exist"))?;
                if tranche.payments == 0 {
                    return Err("nothing to distribute".to_string());
                }
                let investors = tranche.investors.clone();
                let approvals = match self.contracts.get(&token_address) {
                    Some(Contract::TrancheToken(tt)) => &tt.approvals,
                    _ => return Err("tranche token missing".to_string()),
                };
                if let Some(unapproved) = investors
                    .iter()
                    .find(|inv| !approvals.contains(&((*inv).clone(), at.clone())))
                {
                    return Err(format!("investor {unapproved} has not approved the pool"));
                }
                let (_, pool) = self.pool_mut(at)?;
                if let Some(tranche) = pool.tranches.get_mut(&class) {
                    tranche.payments = 0;
                }
                Ok(Vec::new())
            }
            (Some(Contract::TrancheToken(tt)), "setApprovalFor") => {
                let operator = arg_address(args, 0)?;
                let approved = as_bool(arg(args, 1)?, "approved").map_err(|e| e.to_string())?;
                if approved {
                    tt.approvals.insert((from.clone(), operator));
                } else {
                    tt.approvals.remove(&(from.clone(), operator));
                }
                Ok(Vec::new())
            }
            (Some(_), other) => Err(format!("{at} has no method {other}")),
            (None, _) => Err(format!("no contract at {at}")),
        }
    }

    fn pool_mut(&mut self, at: &Address) -> std::result::Result<(Address, &mut Pool), String> {
        match self.contracts.get_mut(at) {
            Some(Contract::Pool(pool)) => Ok((pool.tranche_token.clone(), pool)),
            _ => Err(format!("no pool at {at}")),
        }
    }

    /// Move `amount` of the pool's stablecoin from `owner` under allowance.
    fn pull_stablecoin(&mut self, owner: &Address, pool: &Address, amount: u128) -> std::result::Result<(), String> {
        let stablecoin = match self.contracts.get(pool) {
            Some(Contract::Pool(p)) => p.stablecoin.clone(),
            _ => return Err(format!("no pool at {pool}")),
        };
        let token = self.token_mut(&stablecoin)?;
        let key = (owner.clone(), pool.clone());
        let allowance = token.allowances.get(&key).copied().unwrap_or(0);
        let balance = token.balances.get(owner).copied().unwrap_or(0);
        if allowance < amount {
            return Err(format!("allowance {allowance} below {amount}"));
        }
        if balance < amount {
            return Err(format!("balance {balance} below {amount}"));
        }
        token.allowances.insert(key, allowance - amount);
        token.balances.insert(owner.clone(), balance - amount);
        *token.balances.entry(pool.clone()).or_default() += amount;
        Ok(())
    }

    fn query(&self, at: &Address, method: &str, args: &[Value]) -> std::result::Result<Value, String> {
        match (self.contracts.get(at), method) {
            (Some(Contract::Token(token)), "balanceOf") => {
                let owner = arg_address(args, 0)?;
                Ok(json!(token.balances.get(&owner).copied().unwrap_or(0).to_string()))
            }
            (Some(Contract::Registry(registry)), "getLoanData" | "loanData") => {
                let id = arg_u64(args, 0)?;
                let (principal, rate, maturity) = registry
                    .loans
                    .get(id as usize)
                    .ok_or_else(|| format!("loan {id} does not exist"))?;
                Ok(json!([principal.to_string(), rate, maturity]))
            }
            (Some(Contract::Pool(pool)), _) => self.query_pool(pool, method, args),
            (Some(Contract::TrancheToken(tt)), "balanceOf") => {
                let owner = arg_address(args, 0)?;
                let class = arg_u64(args, 1)?;
                Ok(json!(tt.balances.get(&(owner, class)).copied().unwrap_or(0).to_string()))
            }
            (Some(Contract::TrancheToken(tt)), "isApprovedFor") => {
                let owner = arg_address(args, 0)?;
                let operator = arg_address(args, 1)?;
                Ok(json!(tt.approvals.contains(&(owner, operator))))
            }
            (Some(_), other) => Err(format!("{at} has no view {other}")),
            (None, _) => Err(format!("no contract at {at}")),
        }
    }

    fn query_pool(&self, pool: &Pool, method: &str, args: &[Value]) -> std::result::Result<Value, String> {
        match method {
            "stablecoin" => return Ok(json!(pool.stablecoin)),
            "trancheToken" => return Ok(json!(pool.tranche_token)),
            _ => {}
        }
        let class = arg_u64(args, 0)?;
        let empty = PoolTranche::default();
        let tranche = pool.tranches.get(&class).unwrap_or(&empty);
        let holding = |idx| -> std::result::Result<u128, String> {
            let investor = arg_address(args, idx)?;
            Ok(tranche.holdings.get(&investor).copied().unwrap_or(0))
        };
        match method {
            "tranches" => Ok(json!([tranche.notional.to_string(), tranche.rate_bps])),
            "getLoanIds" => Ok(json!(tranche.loan_ids)),
            "getLoanContracts" => Ok(json!(vec![&pool.registry; tranche.loan_ids.len()])),
            "getInvestors" => Ok(json!(tranche.investors)),
            "payments" => Ok(json!(tranche.payments.to_string())),
            "investorHoldings" => Ok(json!(holding(2)?.to_string())),
            "getExpectedReturn" => {
                let held = holding(2)?;
                Ok(json!((held + tranche.interest_on(held)).to_string()))
            }
            "getTotalExpectedPayout" => {
                let total: u128 = tranche.holdings.values().map(|h| tranche.interest_on(*h)).sum();
                Ok(json!(total.to_string()))
            }
            other => Err(format!("pool has no view {other}")),
        }
    }
}

fn arg(args: &[Value], index: usize) -> std::result::Result<&Value, String> {
    args.get(index).ok_or_else(|| format!("missing argument #{index}"))
}

fn arg_address(args: &[Value], index: usize) -> std::result::Result<Address, String> {
    as_address(arg(args, index)?, "address").map_err(|e| e.to_string())
}

fn arg_u128(args: &[Value], index: usize) -> std::result::Result<u128, String> {
    as_u128(arg(args, index)?, "amount").map_err(|e| e.to_string())
}

fn arg_u64(args: &[Value], index: usize) -> std::result::Result<u64, String> {
    as_u64(arg(args, index)?, "id").map_err(|e| e.to_string())
}

#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<State>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operator(&self) -> Address {
        addr(OPERATOR)
    }

    pub fn investor(&self) -> Address {
        addr(INVESTOR)
    }

    /// Simulate `n` transactions placed by `identity` outside our batches.
    pub fn bump_nonce(&self, identity: &Address, n: u64) {
        *self.state.lock().unwrap().nonces.entry(identity.clone()).or_default() += n;
    }

    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .submitted
            .iter()
            .filter(|tx| tx.call.method() == method)
            .count()
    }

    /// Every later call to `method` reverts.
    pub fn revert_method(&self, method: &str) {
        self.revert_after(method, 0);
    }

    /// The next `passes` calls to `method` succeed, every later one reverts.
    pub fn revert_after(&self, method: &str, passes: usize) {
        self.state.lock().unwrap().reverts.insert(method.to_string(), passes);
    }

    pub fn clear_reverts(&self) {
        self.state.lock().unwrap().reverts.clear();
    }

    /// Receipts of later submissions stay pending for `polls` lookups.
    pub fn delay_receipts(&self, polls: u32) {
        self.state.lock().unwrap().receipt_delay = polls;
    }

    /// Drop `event` from later receipts.
    pub fn suppress_event(&self, event: &str) {
        self.state.lock().unwrap().suppressed.insert(event.to_string());
    }

    /// Place `call` as `from` with the correct nonce and return its receipt,
    /// bypassing receipt delays.
    pub fn run(&self, from: &Address, call: LedgerCall) -> Receipt {
        let mut state = self.state.lock().unwrap();
        let nonce = state.nonces.get(from).copied().unwrap_or(0);
        state.nonces.insert(from.clone(), nonce + 1);
        state.submitted.push(SubmittedTx {
            from: from.clone(),
            nonce,
            call: call.clone(),
        });
        let (contract_address, logs) = state.execute(from, &call).unwrap();
        Receipt {
            tx_hash: format!("0x{:064x}", state.submitted.len()),
            succeeded: true,
            contract_address,
            revert_reason: None,
            logs,
        }
    }

    /// Deploy a stablecoin, a loan registry and a pool over them.
    pub async fn deploy_registry_and_pool(&self) -> (Address, Address) {
        let operator = self.operator();
        let deployed = |artifact: &str, args| {
            self.run(&operator, LedgerCall::deploy(artifact, args))
                .contract_address
                .unwrap()
        };
        let stablecoin = deployed("MockERC20", vec![]);
        let registry = deployed("LoanNFT", vec![]);
        let pool = deployed("Pool", vec![json!(registry), json!(stablecoin)]);
        (registry, pool)
    }

    /// A pool with one loan per tranche and rates 500/300/100 bps.
    pub async fn pool_with_tranches(&self, notionals: [u128; 3]) -> Address {
        let (registry, pool) = self.deploy_registry_and_pool().await;
        let operator = self.operator();
        for (i, (notional, bps)) in notionals.into_iter().zip([500u32, 300, 100]).enumerate() {
            self.run(
                &operator,
                LedgerCall::invoke(
                    &registry,
                    "mint",
                    vec![json!(pool), json!(notional.to_string()), json!(bps), json!(1_900_000_000_000i64)],
                ),
            );
            self.run(
                &operator,
                LedgerCall::invoke(
                    &pool,
                    "createTranche",
                    vec![json!(i + 1), json!([i]), json!(notional.to_string()), json!(bps)],
                ),
            );
        }
        pool
    }
}

impl Ledger for FakeLedger {
    async fn pending_nonce(&self, identity: &Address) -> Result<u64> {
        Ok(self.state.lock().unwrap().nonces.get(identity).copied().unwrap_or(0))
    }

    async fn submit(&self, from: &Address, nonce: u64, call: &LedgerCall) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let expected = state.nonces.get(from).copied().unwrap_or(0);
        if nonce != expected {
            return Err(OrchestratorError::Rpc(format!(
                "invalid nonce for {from}: expected {expected}, got {nonce}"
            )));
        }
        state.nonces.insert(from.clone(), expected + 1);
        state.submitted.push(SubmittedTx {
            from: from.clone(),
            nonce,
            call: call.clone(),
        });
        let tx_hash = format!("0x{:064x}", state.submitted.len());

        let receipt = match state.execute(from, call) {
            Ok((contract_address, logs)) => Receipt {
                tx_hash: tx_hash.clone(),
                succeeded: true,
                contract_address,
                revert_reason: None,
                logs,
            },
            Err(reason) => Receipt {
                tx_hash: tx_hash.clone(),
                succeeded: false,
                contract_address: None,
                revert_reason: Some(reason),
                logs: Vec::new(),
            },
        };
        let polls_left = state.receipt_delay;
        state
            .receipts
            .insert(tx_hash.clone(), PendingReceipt { polls_left, receipt });
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>> {
        let mut state = self.state.lock().unwrap();
        match state.receipts.get_mut(tx_hash) {
            Some(pending) if pending.polls_left > 0 => {
                pending.polls_left -= 1;
                Ok(None)
            }
            Some(pending) => Ok(Some(pending.receipt.clone())),
            None => Ok(None),
        }
    }

    async fn query(&self, contract: &Address, method: &str, args: Vec<Value>) -> Result<Value> {
        self.state
            .lock()
            .unwrap()
            .query(contract, method, &args)
            .map_err(OrchestratorError::Rpc)
    }
}
