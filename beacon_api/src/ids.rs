use parse_display::{Display, FromStr};
use types::primitives::{Slot, H256};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, FromStr)]
#[display(style = "lowercase")]
pub enum BlockId {
    Head,
    Finalized,
    #[display("{0}")]
    Slot(Slot),
    #[display("{0:?}")]
    Root(H256),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, FromStr)]
#[display(style = "lowercase")]
pub enum StateId {
    Head,
    Finalized,
    #[display("{0}")]
    Slot(Slot),
    #[display("{0:?}")]
    Root(H256),
}
