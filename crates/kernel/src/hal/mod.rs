// Hardware access layer.

pub mod mmio;
