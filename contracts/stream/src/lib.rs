#![no_std]

mod accrual;
mod terms;

use soroban_sdk::{
    contract, contractimpl, contracttype, symbol_short, token, Address, Bytes, BytesN, Env,
};

pub use terms::TERMS_ENCODING_VERSION;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Global configuration for the stream ledger.
#[contracttype]
#[derive(Clone, Debug)]
pub struct Config {
    pub token: Address,
}

#[soroban_sdk::contracterror]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ContractError {
    Unauthorized = 0,
    InvalidSignature = 1,
    StreamStillActive = 2,
    InvalidStreamId = 3,
    InvalidAmount = 4,
    InvalidTimeframe = 5,
}

/// Half-open window of ledger sequence numbers `[start_block, stop_block)`
/// during which a stream accrues.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeframe {
    pub start_block: u32,
    pub stop_block: u32,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Stream {
    pub sender: Address,
    pub recipient: Address,
    pub balance: i128,
    pub withdrawn_balance: i128,
    pub payment_per_block: i128,
    pub timeframe: Timeframe,
}

/// Namespace for all contract storage keys.
#[contracttype]
pub enum DataKey {
    Config,              // Instance storage for global settings (token).
    LatestStreamId,      // Instance storage for the auto-incrementing ID counter.
    Stream(u64),         // Persistent storage for individual stream data.
    SigningKey(Address), // Persistent secp256k1 key used to check counter-signatures.
}

const TTL_THRESHOLD: u32 = 17280;
const TTL_EXTEND_TO: u32 = 120960;

// ---------------------------------------------------------------------------
// Storage helpers
// ---------------------------------------------------------------------------

fn get_config(env: &Env) -> Config {
    env.storage()
        .instance()
        .get(&DataKey::Config)
        .expect("contract not initialised: missing config")
}

fn get_token(env: &Env) -> Address {
    get_config(env).token
}

fn get_stream_count(env: &Env) -> u64 {
    env.storage()
        .instance()
        .get(&DataKey::LatestStreamId)
        .unwrap_or(0u64)
}

fn set_stream_count(env: &Env, count: u64) {
    env.storage().instance().set(&DataKey::LatestStreamId, &count);
}

fn load_stream(env: &Env, stream_id: u64) -> Result<Stream, ContractError> {
    env.storage()
        .persistent()
        .get(&DataKey::Stream(stream_id))
        .ok_or(ContractError::InvalidStreamId)
}

fn save_stream(env: &Env, stream_id: u64, stream: &Stream) {
    let key = DataKey::Stream(stream_id);
    env.storage().persistent().set(&key, stream);
    env.storage()
        .persistent()
        .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
}

fn load_signing_key(env: &Env, owner: &Address) -> Option<BytesN<65>> {
    env.storage()
        .persistent()
        .get(&DataKey::SigningKey(owner.clone()))
}

fn save_signing_key(env: &Env, owner: &Address, public_key: &BytesN<65>) {
    let key = DataKey::SigningKey(owner.clone());
    env.storage().persistent().set(&key, public_key);
    env.storage()
        .persistent()
        .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
}

// ---------------------------------------------------------------------------
// Internal Helpers
// ---------------------------------------------------------------------------

impl BlockStream {
    fn validate_terms(
        payment_per_block: i128,
        timeframe: &Timeframe,
    ) -> Result<(), ContractError> {
        if payment_per_block <= 0 {
            return Err(ContractError::InvalidAmount);
        }
        if timeframe.start_block >= timeframe.stop_block {
            return Err(ContractError::InvalidTimeframe);
        }
        Ok(())
    }

    fn require_positive(amount: i128) -> Result<(), ContractError> {
        if amount <= 0 {
            return Err(ContractError::InvalidAmount);
        }
        Ok(())
    }

    fn accrued_now(env: &Env, stream: &Stream) -> i128 {
        accrual::calculate_accrued_amount(
            stream.timeframe.start_block,
            stream.timeframe.stop_block,
            stream.payment_per_block,
            stream.balance,
            env.ledger().sequence(),
        )
    }

    /// Returns the party whose signature must accompany an amendment proposed
    /// by `caller`.
    fn counterparty(stream: &Stream, caller: &Address) -> Result<Address, ContractError> {
        if *caller == stream.sender {
            Ok(stream.recipient.clone())
        } else if *caller == stream.recipient {
            Ok(stream.sender.clone())
        } else {
            Err(ContractError::Unauthorized)
        }
    }

    /// Recovers the key that produced `signature` over `hash` and compares it
    /// with the key `signer` registered.
    ///
    /// The ECDSA digest is `sha256(hash)`, i.e. the 32-byte hash is signed as
    /// a message with ECDSA/SHA-256.
    fn verify_signature(
        env: &Env,
        hash: &BytesN<32>,
        signature: &BytesN<65>,
        signer: &Address,
    ) -> bool {
        let Some(public_key) = load_signing_key(env, signer) else {
            return false;
        };

        let raw = signature.to_array();
        let recovery_id = raw[64] as u32;
        if recovery_id > 3 {
            return false;
        }
        let mut compact = [0u8; 64];
        compact.copy_from_slice(&raw[..64]);

        let digest = env
            .crypto()
            .sha256(&Bytes::from_array(env, &hash.to_array()));
        let recovered = env.crypto().secp256k1_recover(
            &digest,
            &BytesN::from_array(env, &compact),
            recovery_id,
        );
        recovered == public_key
    }
}

// ---------------------------------------------------------------------------
// Contract Implementation
// ---------------------------------------------------------------------------

#[contract]
pub struct BlockStream;

#[contractimpl]
impl BlockStream {
    /// Initialise the contract with the token every stream is denominated in.
    ///
    /// Must be called exactly once before any other operation. Stores
    /// `Config { token }` in instance storage and resets the stream id counter
    /// to 0.
    ///
    /// # Panics
    /// - If called more than once (contract already initialised)
    pub fn init(env: Env, token: Address) {
        if env.storage().instance().has(&DataKey::Config) {
            panic!("already initialised");
        }
        let config = Config { token };
        env.storage().instance().set(&DataKey::Config, &config);
        env.storage().instance().set(&DataKey::LatestStreamId, &0u64);

        env.storage()
            .instance()
            .extend_ttl(TTL_THRESHOLD, TTL_EXTEND_TO);
    }

    /// Open a new stream from `sender` to `recipient`.
    ///
    /// Moves `initial_balance` from the sender into the contract's custody and
    /// registers a stream that pays `payment_per_block` to the recipient for
    /// every ledger inside `timeframe`.
    ///
    /// # Returns
    /// - `u64`: the new stream's id. Ids are sequential starting from 0.
    ///
    /// # Authorization
    /// - Requires authorization from `sender`
    ///
    /// # Errors
    /// - `InvalidAmount` if `initial_balance` or `payment_per_block` is not positive
    /// - `InvalidTimeframe` if `start_block >= stop_block`
    ///
    /// # Events
    /// - Publishes `created(stream_id)` with the initial balance
    ///
    /// # Usage Notes
    /// - The balance does not have to cover `rate × duration`. Accrual is capped
    ///   at whatever has been deposited, and the sender can `refuel` later.
    /// - If the token transfer fails the invocation aborts and no id is consumed.
    pub fn stream_to(
        env: Env,
        sender: Address,
        recipient: Address,
        initial_balance: i128,
        timeframe: Timeframe,
        payment_per_block: i128,
    ) -> Result<u64, ContractError> {
        sender.require_auth();

        Self::require_positive(initial_balance)?;
        Self::validate_terms(payment_per_block, &timeframe)?;

        let token_client = token::Client::new(&env, &get_token(&env));
        token_client.transfer(&sender, &env.current_contract_address(), &initial_balance);

        let stream_id = get_stream_count(&env);
        set_stream_count(&env, stream_id + 1);

        let stream = Stream {
            sender,
            recipient,
            balance: initial_balance,
            withdrawn_balance: 0,
            payment_per_block,
            timeframe,
        };
        save_stream(&env, stream_id, &stream);

        env.events()
            .publish((symbol_short!("created"), stream_id), initial_balance);

        Ok(stream_id)
    }

    /// Add `amount` to a stream's balance. Only the stream's sender may refuel.
    ///
    /// # Errors
    /// - `InvalidStreamId` if the stream does not exist
    /// - `Unauthorized` if `caller` is not the sender
    /// - `InvalidAmount` if `amount` is not positive
    pub fn refuel(
        env: Env,
        stream_id: u64,
        caller: Address,
        amount: i128,
    ) -> Result<(), ContractError> {
        caller.require_auth();

        let mut stream = load_stream(&env, stream_id)?;
        if caller != stream.sender {
            return Err(ContractError::Unauthorized);
        }
        Self::require_positive(amount)?;

        let balance = stream
            .balance
            .checked_add(amount)
            .ok_or(ContractError::InvalidAmount)?;

        let token_client = token::Client::new(&env, &get_token(&env));
        token_client.transfer(&caller, &env.current_contract_address(), &amount);

        stream.balance = balance;
        save_stream(&env, stream_id, &stream);

        env.events()
            .publish((symbol_short!("refueled"), stream_id), amount);
        Ok(())
    }

    /// Pay the recipient everything accrued and not yet withdrawn.
    ///
    /// The amount is `accrued(now) - withdrawn_balance`, where accrual counts
    /// the blocks elapsed since `start_block` (capped at `stop_block`) times the
    /// rate, capped at the stream's balance.
    ///
    /// # Returns
    /// - `i128`: the amount transferred (0 if nothing is owed)
    ///
    /// # Errors
    /// - `InvalidStreamId` if the stream does not exist
    /// - `Unauthorized` if `caller` is not the recipient
    ///
    /// # Zero Withdrawable Behavior
    /// - Returns 0 with no transfer, no state change and no event. Calling
    ///   twice in the same ledger therefore moves funds only once.
    ///
    /// # Events
    /// - Publishes `withdrew(stream_id)` with the amount when it is positive
    pub fn withdraw(env: Env, stream_id: u64, caller: Address) -> Result<i128, ContractError> {
        caller.require_auth();

        let mut stream = load_stream(&env, stream_id)?;
        if caller != stream.recipient {
            return Err(ContractError::Unauthorized);
        }

        let accrued = Self::accrued_now(&env, &stream);
        let owed = accrual::owed_to_recipient(accrued, stream.withdrawn_balance);
        if owed == 0 {
            return Ok(0);
        }

        // CEI: update state before external token transfer.
        stream.withdrawn_balance += owed;
        save_stream(&env, stream_id, &stream);

        let token_client = token::Client::new(&env, &get_token(&env));
        token_client.transfer(&env.current_contract_address(), &stream.recipient, &owed);

        env.events()
            .publish((symbol_short!("withdrew"), stream_id), owed);
        Ok(owed)
    }

    /// Return the unaccrued remainder of a finished stream to its sender.
    ///
    /// Only callable once the current ledger has reached `stop_block`; from
    /// then on accrual is final and everything above it belongs to the sender.
    /// The refunded amount is removed from `balance`, so a second refund
    /// returns 0. Funds accrued but not yet withdrawn stay in custody for the
    /// recipient.
    ///
    /// # Errors
    /// - `InvalidStreamId` if the stream does not exist
    /// - `Unauthorized` if `caller` is not the sender
    /// - `StreamStillActive` if the current ledger is before `stop_block`
    ///
    /// # Events
    /// - Publishes `refunded(stream_id)` with the amount when it is positive
    pub fn refund(env: Env, stream_id: u64, caller: Address) -> Result<i128, ContractError> {
        caller.require_auth();

        let mut stream = load_stream(&env, stream_id)?;
        if caller != stream.sender {
            return Err(ContractError::Unauthorized);
        }
        if env.ledger().sequence() < stream.timeframe.stop_block {
            return Err(ContractError::StreamStillActive);
        }

        let accrued = Self::accrued_now(&env, &stream);
        let excess =
            accrual::refundable_excess(stream.balance, accrued, stream.withdrawn_balance);
        if excess == 0 {
            return Ok(0);
        }

        stream.balance -= excess;
        save_stream(&env, stream_id, &stream);

        let token_client = token::Client::new(&env, &get_token(&env));
        token_client.transfer(&env.current_contract_address(), &stream.sender, &excess);

        env.events()
            .publish((symbol_short!("refunded"), stream_id), excess);
        Ok(excess)
    }

    /// Total amount accrued to the recipient at the current ledger.
    pub fn calculate_accrued(env: Env, stream_id: u64) -> Result<i128, ContractError> {
        let stream = load_stream(&env, stream_id)?;
        Ok(Self::accrued_now(&env, &stream))
    }

    /// What `who` could take out of the stream right now.
    ///
    /// | Party       | Value                                          |
    /// |-------------|------------------------------------------------|
    /// | recipient   | `accrued - withdrawn_balance`                  |
    /// | sender      | `balance - max(accrued, withdrawn_balance)`    |
    /// | anyone else | `0`                                            |
    ///
    /// The sender's figure only becomes claimable through `refund` once the
    /// stream has ended.
    pub fn balance_of(env: Env, stream_id: u64, who: Address) -> Result<i128, ContractError> {
        let stream = load_stream(&env, stream_id)?;
        let accrued = Self::accrued_now(&env, &stream);

        let amount = if who == stream.recipient {
            accrual::owed_to_recipient(accrued, stream.withdrawn_balance)
        } else if who == stream.sender {
            accrual::refundable_excess(stream.balance, accrued, stream.withdrawn_balance)
        } else {
            0
        };
        Ok(amount)
    }

    /// Digest of proposed stream terms, signed off-chain by the counterparty.
    ///
    /// `sha256` over the canonical encoding of
    /// `(version, stream_id, payment_per_block, start_block, stop_block)`
    /// followed by this contract's address, so a digest never matches terms
    /// of another deployment. Identical inputs always give the same digest,
    /// and the stream does not have to exist.
    pub fn hash_stream(
        env: Env,
        stream_id: u64,
        payment_per_block: i128,
        timeframe: Timeframe,
    ) -> BytesN<32> {
        let payload = terms::encode_terms(
            &env,
            &env.current_contract_address(),
            stream_id,
            payment_per_block,
            &timeframe,
        );
        env.crypto().sha256(&payload).into()
    }

    /// Register (or rotate) the secp256k1 public key `owner` signs amendments
    /// with, in uncompressed SEC1 form (`0x04 || x || y`).
    ///
    /// # Authorization
    /// - Requires authorization from `owner`
    ///
    /// # Events
    /// - Publishes `key_set(owner)` with the public key
    pub fn set_signing_key(env: Env, owner: Address, public_key: BytesN<65>) {
        owner.require_auth();
        save_signing_key(&env, &owner, &public_key);

        env.events()
            .publish((symbol_short!("key_set"), owner), public_key);
    }

    pub fn get_signing_key(env: Env, owner: Address) -> Option<BytesN<65>> {
        load_signing_key(&env, &owner)
    }

    /// Check that `signature` over `hash` was produced by `signer`'s registered key.
    ///
    /// `signature` is a recoverable ECDSA signature `r || s || v` with
    /// `v` in `0..=3`. Returns `false` when `signer` has no registered key,
    /// when `v` is out of range, or when the recovered key differs from the
    /// registered one. Only a signature that is not a valid curve signature
    /// at all (e.g. `r = 0`) makes the host abort the call.
    pub fn validate_signature(
        env: Env,
        hash: BytesN<32>,
        signature: BytesN<65>,
        signer: Address,
    ) -> bool {
        Self::verify_signature(&env, &hash, &signature, &signer)
    }

    /// Amend a stream's rate and timeframe with the consent of both parties.
    ///
    /// The caller (either party) submits the new terms together with the other
    /// party's signature over `hash_stream(stream_id, payment_per_block, timeframe)`.
    /// The digest is recomputed here, so a signature only ever authorises the
    /// exact terms it was produced for.
    ///
    /// # Returns
    /// - `true` once the new terms are stored
    ///
    /// # Errors
    /// - `InvalidStreamId` if the stream does not exist
    /// - `Unauthorized` if `caller` is not a party to the stream, or `signer`
    ///   is not the other party
    /// - `InvalidAmount` / `InvalidTimeframe` for malformed terms
    /// - `InvalidSignature` if `signer` has no registered signing key or the
    ///   signature was not produced by it over these exact terms
    ///
    /// # Usage Notes
    /// - Balances are untouched. Funds already withdrawn are never clawed back,
    ///   even when the new terms accrue less than has been paid out.
    /// - The digest carries no amendment counter. A counter-signature stays
    ///   valid for its terms on this stream, so after amending from terms A to
    ///   B, the party holding the signature for A can restore A on its own.
    ///   Parties that need one-shot consent should rotate their signing key
    ///   after each amendment (`set_signing_key`).
    ///
    /// # Events
    /// - Publishes `updated(stream_id)` with the new `(payment_per_block, timeframe)`
    pub fn update_details(
        env: Env,
        stream_id: u64,
        caller: Address,
        payment_per_block: i128,
        timeframe: Timeframe,
        signer: Address,
        signature: BytesN<65>,
    ) -> Result<bool, ContractError> {
        caller.require_auth();

        let mut stream = load_stream(&env, stream_id)?;
        if Self::counterparty(&stream, &caller)? != signer {
            return Err(ContractError::Unauthorized);
        }
        Self::validate_terms(payment_per_block, &timeframe)?;

        let hash = Self::hash_stream(env.clone(), stream_id, payment_per_block, timeframe);
        if !Self::verify_signature(&env, &hash, &signature, &signer) {
            return Err(ContractError::InvalidSignature);
        }

        stream.payment_per_block = payment_per_block;
        stream.timeframe = timeframe;
        save_stream(&env, stream_id, &stream);

        env.events().publish(
            (symbol_short!("updated"), stream_id),
            (payment_per_block, timeframe),
        );
        Ok(true)
    }

    /// Retrieve a stream by id, or `None` if it was never created.
    pub fn get_stream(env: Env, stream_id: u64) -> Option<Stream> {
        load_stream(&env, stream_id).ok()
    }

    /// The stream id counter: the id the next stream will receive, which is
    /// also the number of streams created so far.
    pub fn get_latest_stream_id(env: Env) -> u64 {
        get_stream_count(&env)
    }

    /// Retrieve the global contract configuration.
    ///
    /// # Panics
    /// - If the contract has not been initialised
    pub fn get_config(env: Env) -> Config {
        get_config(&env)
    }
}
