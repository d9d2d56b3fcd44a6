#![no_main]
use libfuzzer_sys::fuzz_target;

use colora::fuzzing::FuzzFunc;
use colora::test_framework as ir;
use regcolor;

static mut COUNTER_GEN: usize = 0;
static mut COUNTER_OK: usize = 0;

fuzz_target!(|func: FuzzFunc| {
    let (num_gen, num_ok) = unsafe {
        COUNTER_GEN += 1;
        (COUNTER_GEN, COUNTER_OK)
    };

    println!(
        "=== status: #ok/#total: {}/{} == {} ",
        num_ok,
        num_gen,
        100.0 * (num_ok as f64) / (num_gen as f64)
    );

    let FuzzFunc(mut func) = func;
    let original_func = func.clone();

    let reg_universe = ir::make_universe(4);
    let opts = regcolor::Options {
        run_checker: true,
        ..Default::default()
    };

    match regcolor::allocate_registers(&mut func, &reg_universe, &opts) {
        Ok(_) => unsafe {
            COUNTER_OK += 1;
        },
        Err(err) => {
            if let regcolor::RegAllocError::Checker(_) = &err {
                println!("{}", original_func);
                panic!("irc: checker error: {:?}", err);
            }
            println!("allocation error: {}", err);
        }
    }
});
