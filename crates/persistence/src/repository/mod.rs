pub mod cycles;
pub mod filters;
pub mod positions;
pub mod scenarios;

pub use cycles::CycleRepository;
pub use filters::FilterRepository;
pub use positions::PositionRepository;
pub use scenarios::ScenarioRepository;
