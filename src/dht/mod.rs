//! Mainline DHT (BEP 5): the Kademlia routing table (C6) and the KRPC node
//! that queries/serves it over UDP (C7).
pub mod krpc;
pub mod node;
pub mod routing_table;
pub mod token;

pub use node::{DhtError, DhtNode};
pub use routing_table::{Contact, RoutingTable};
