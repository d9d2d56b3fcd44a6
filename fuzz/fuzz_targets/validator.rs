#![no_main]
use libfuzzer_sys::fuzz_target;

use colora::fuzzing::FuzzFunc;
use colora::validator::validate;

fuzz_target!(|func: FuzzFunc| {
    // Generated functions are well formed by construction.
    if let Err(err) = validate(&func.0) {
        panic!("validation error: {}\n{}", err, func.0);
    }
});
