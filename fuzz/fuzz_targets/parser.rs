#![no_main]
use libfuzzer_sys::fuzz_target;

use colora::fuzzing::FuzzFunc;
use colora::parser;

fuzz_target!(|func: FuzzFunc| {
    let printed = format!("{}", func.0);

    let parsed_func = parser::parse_content("funk", &printed).expect("parser error");
    let reprinted = format!("{}", parsed_func);

    let reparsed_func = parser::parse_content("funk", &reprinted)
        .expect("shouldn't error on the second parse!");
    let rereprinted = format!("{}", reparsed_func);

    assert_eq!(reprinted, rereprinted);
});
