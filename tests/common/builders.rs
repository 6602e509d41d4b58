//! Test data builders for creating test objects

use telewatch_rs::{SparseMemoryImage, VariableDescription, VariableType};

/// Builder for variable descriptions
pub struct VariableBuilder {
    path: String,
    address: u64,
    var_type: VariableType,
}

impl VariableBuilder {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            address: 0x2000_0000,
            var_type: VariableType::U32,
        }
    }

    pub fn address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    pub fn var_type(mut self, var_type: VariableType) -> Self {
        self.var_type = var_type;
        self
    }

    /// Display path and description, ready for `Datastore::add_variable`
    pub fn build(self) -> (String, VariableDescription) {
        (self.path, VariableDescription::new(self.address, self.var_type))
    }
}

/// Builder for emulated device memory
#[derive(Default)]
pub struct ImageBuilder {
    image: SparseMemoryImage,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, base: u64, size: usize) -> Self {
        self.image.add_region(base, size).unwrap();
        self
    }

    pub fn bytes(mut self, address: u64, data: &[u8]) -> Self {
        self.image.write(address, data).unwrap();
        self
    }

    pub fn build(self) -> SparseMemoryImage {
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_builder() {
        let (path, desc) = VariableBuilder::new("/test")
            .address(0x2000_1000)
            .var_type(VariableType::F32)
            .build();

        assert_eq!(path, "/test");
        assert_eq!(desc.address, 0x2000_1000);
        assert_eq!(desc.var_type, VariableType::F32);
    }

    #[test]
    fn test_image_builder() {
        let image = ImageBuilder::new()
            .region(0x100, 16)
            .bytes(0x104, &[1, 2])
            .build();
        assert_eq!(image.read(0x103, 4).unwrap(), vec![0, 1, 2, 0]);
    }
}
