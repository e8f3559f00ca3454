//! Round engine for rotating savings pools: the pool aggregate, contribution
//! and payout state machines, invitation lifecycle and the MFA verifier.
//!
//! Everything here is synchronous and free of I/O. Callers load an aggregate,
//! apply one operation against an injected `now`, and persist the result with
//! a conditional write.

pub mod contribution;
pub mod errors;
pub mod intents;
pub mod invitation;
pub mod mfa;
pub mod payment_display;
pub mod payout;
pub mod policy;
pub mod pool;
pub mod totp;

pub use contribution::{ContributionRecord, ContributionStatus, PaymentMethod};
pub use errors::EngineError;
pub use intents::{NotificationIntent, Outcome};
pub use invitation::{Invitation, InvitationStatus, normalize_email};
pub use mfa::{MfaMethod, MfaState, MfaStatus, MfaVerification, TotpEnrollment};
pub use payment_display::{PaymentDisplay, payment_display};
pub use payout::PayoutReceipt;
pub use policy::{ContributionVerification, MfaPolicy, PoolPolicy};
pub use pool::{
    Frequency, LedgerTotals, LedgerTransaction, Member, MemberIdentity, MemberRole, MemberStatus,
    NewPool, Pool, PoolStatus, TransactionKind, TransactionStatus,
};
