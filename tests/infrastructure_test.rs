//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{ImageBuilder, VariableBuilder};
use telewatch_rs::VariableType;

#[test]
fn test_infrastructure_setup() {
    let (path, desc) = VariableBuilder::new("/test_var")
        .address(0x2000_0100)
        .var_type(VariableType::F32)
        .build();

    assert_eq!(path, "/test_var");
    assert_eq!(desc.address, 0x2000_0100);
    assert_eq!(desc.byte_len(), 4);

    let image = ImageBuilder::new().region(0x2000_0100, 4).build();
    assert!(image.contains(desc.address, desc.byte_len()));
}

#[test]
fn test_wait_until() {
    let mut calls = 0;
    assert!(common::wait_until(common::test_timeout(), || {
        calls += 1;
        calls == 3
    }));
    assert!(!common::wait_until(std::time::Duration::from_millis(10), || false));
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}
