#![no_main]
use libfuzzer_sys::fuzz_target;

use colora::fuzzing::FuzzFunc;
use colora::{test_framework as ir, validator};
use regcolor;

fuzz_target!(|func: FuzzFunc| {
    let FuzzFunc(func) = func;

    let input = ir::RunInput::default();
    let expected =
        ir::run_func(&func, "Before allocation", &input, ir::RunStage::BeforeRegalloc);
    if expected.is_err() {
        return;
    }

    println!("{}", func);

    let reg_universe = ir::make_universe(6);
    for algorithm in [regcolor::RegAllocAlgorithm::Full, regcolor::RegAllocAlgorithm::Naive] {
        let mut func = func.clone();
        let opts = regcolor::Options {
            algorithm,
            run_checker: true,
            ..Default::default()
        };
        if let Err(err) = regcolor::allocate_registers(&mut func, &reg_universe, &opts) {
            if let regcolor::RegAllocError::Checker(_) = &err {
                panic!("differential: checker error: {:?}", err);
            }
            println!("allocation error: {}", err);
            continue;
        }

        println!("{}", func);
        if let Err(err) = validator::validate_allocated(&func, &reg_universe) {
            panic!("differential: {}", err);
        }

        let observed =
            ir::run_func(&func, "After allocation", &input, ir::RunStage::AfterRegalloc);
        validator::check_results(&expected, &observed);
    }
});
