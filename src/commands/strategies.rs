use crate::strategy::StrategyCatalog;
use anyhow::Result;

pub fn run(catalog: &StrategyCatalog) -> Result<()> {
    for descriptor in catalog.descriptors() {
        println!("{}: {}", descriptor.name, descriptor.description);
        for spec in &descriptor.parameters {
            println!(
                "    {:<20} default {:<8} range [{}, {}]  {}",
                spec.name, spec.default, spec.min, spec.max, spec.description
            );
        }
    }
    Ok(())
}
