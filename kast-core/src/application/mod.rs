/// Bundles the repository ports the services are built from
pub mod unit_of_work;

pub use unit_of_work::ScanUnitOfWork;
