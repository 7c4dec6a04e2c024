//! Core data model: currencies, accounts, sessions, raw rows, canonical
//! transactions and resumption cursors.

pub mod account;
pub mod canonical;
pub mod currency;
pub mod cursor;
pub mod raw;
pub mod session;

pub use account::{Account, AccountPatch, AccountSpec, AccountType, VerificationMetadata};
pub use canonical::{
	CanonicalTransaction, Direction, Fee, FeeScope, FeeSettlement, Movement, Operation,
	OperationCategory, OperationType, Price, TransactionStatus, ValidationError,
};
pub use currency::{AssetClass, Currency};
pub use cursor::{Cursor, CursorMetadata, CursorPosition, FetchStatus};
pub use raw::{event_id, NewRawTransaction, ProcessingStatus, RawTransaction, TransactionKind};
pub use session::{ImportSession, SessionOutcome, SessionStatus};
