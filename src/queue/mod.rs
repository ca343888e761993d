pub(crate) mod inbox;
pub(crate) mod outbox;
