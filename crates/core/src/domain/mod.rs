pub mod decision;
pub mod memory;
pub mod policy;
pub mod proposal;
pub mod record;
pub mod tenant;
