use lsm_compiler_backend::*;

fn main() {
    let params = match ImagingParameters::from_config(&OpticalTrain::default(), &ScanSettings::default()) {
        Ok(params) => params,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    let program = match SweepProgram::new(&params) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    let signal = program.calc_signal();
    println!("{:?}", program.timing());
    // First exposure window of every channel
    let spe = program.timing().samples_per_exposure;
    println!("{:?}", signal.slice(ndarray::s![.., ..spe]));
}
