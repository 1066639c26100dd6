//! Block-height accrual math. Pure functions, no storage access.

/// Amount accrued to the recipient by ledger `at_block`.
///
/// `payment_per_block × (min(at_block, stop_block) - start_block)`, zero
/// before `start_block`, capped at `balance`. An overflowing product always
/// exceeds the balance, so it saturates to `balance`.
pub fn calculate_accrued_amount(
    start_block: u32,
    stop_block: u32,
    payment_per_block: i128,
    balance: i128,
    at_block: u32,
) -> i128 {
    let elapsed = at_block.min(stop_block).saturating_sub(start_block);
    if elapsed == 0 || payment_per_block <= 0 || balance <= 0 {
        return 0;
    }

    payment_per_block
        .checked_mul(elapsed as i128)
        .map_or(balance, |accrued| accrued.min(balance))
}

/// Accrued funds the recipient has not taken out yet.
///
/// Zero when an amendment pushed accrual below what was already withdrawn.
pub fn owed_to_recipient(accrued: i128, withdrawn_balance: i128) -> i128 {
    (accrued - withdrawn_balance).max(0)
}

/// Part of the balance that will never accrue to the recipient.
pub fn refundable_excess(balance: i128, accrued: i128, withdrawn_balance: i128) -> i128 {
    (balance - accrued.max(withdrawn_balance)).max(0)
}
