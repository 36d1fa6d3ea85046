// Smart Trade - Market data recorder and AI recommendation engine
// core: types, config, logging | layer1: connectors | layer2: processing | layer3: recommendations

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;
