pub mod crm;

pub use crm::CrmChannel;
