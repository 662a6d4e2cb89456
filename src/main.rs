//! CLI driver. Reproduces the original tool's dispatch verbatim:
//!
//! ```text
//! gmpack -b PackageName SourceDirName[1] ... SourceDirName[n]
//! gmpack -i InstallDirName PackageName
//! gmpack -e SourceFile DestFile [KeyFile]
//! ```
//!
//! Exit code is always 0; failures print one message per line instead.

use std::path::{Path, PathBuf};

use clap::{Arg, Command};
use gmpack::{Builder, Installer};
use tracing_subscriber::EnvFilter;

fn print_usage(app_name: &str) {
    println!("Usage: ");
    println!(
        "    Build   package: {} -b PackageName SourceDirName[1]...SourceDirName[n]",
        app_name
    );
    println!("    Install package: {} -i InstallDirName PackageName", app_name);
    println!("    Encrypt file:    {} -e SourceFile DestFile [KeyFile]", app_name);
}

fn build_package(package_name: &str, source_dirs: &[String]) {
    if source_dirs.is_empty() {
        return;
    }

    if source_dirs.len() > 1 {
        println!("Source Dir Name List: ");
        for dir in source_dirs {
            println!("    {}", dir);
        }
    } else {
        println!("Source Dir Name: {}", source_dirs[0]);
    }

    let mut failed_dirs = Vec::new();
    let mut builder = Builder::new();
    builder.set_package_filename(package_name);

    for (index, source_dir) in source_dirs.iter().enumerate() {
        if let Err(e) = builder.set_source_dir(source_dir) {
            println!("  {}: {}", source_dir, e);
            failed_dirs.push(source_dir.clone());
            continue;
        }
        let ok = if index == 0 {
            builder.build_package()
        } else {
            builder.append_file_list_to_package()
        };
        if !ok {
            failed_dirs.push(source_dir.clone());
            for message in builder.error_message() {
                println!("  {}", message);
            }
        }
    }

    if failed_dirs.is_empty() {
        println!("Build success!");
    } else {
        print!("Build source dirs: ");
        for dir in &failed_dirs {
            print!("{} ", dir);
        }
        println!("to package failure!");
    }
}

fn install_package(install_dir: &str, package_name: &str) {
    println!("InstallDirName: {}", install_dir);

    let mut installer = Installer::new(install_dir);
    installer.set_package_filename(package_name);
    if installer.install_package() {
        println!("Install Success!");
    } else {
        for message in installer.error_message() {
            println!("  {}", message);
        }
    }
}

fn encrypt(src: &str, dst: &str, key_file: Option<&str>) {
    let key = match key_file {
        Some(path) => gmpack::rc4::read_key_file(Path::new(path)).unwrap_or_default(),
        None => Vec::new(),
    };
    if let Err(e) = gmpack::rc4::encrypt_file(Path::new(src), Path::new(dst), &key) {
        println!("  {}", e);
    }
}

fn build_cli() -> Command {
    Command::new("gmpack")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new("build")
                .short('b')
                .num_args(2..)
                .value_names(["PackageName", "SourceDirName"]),
        )
        .arg(
            Arg::new("install")
                .short('i')
                .num_args(2)
                .value_names(["InstallDirName", "PackageName"]),
        )
        .arg(
            Arg::new("encrypt")
                .short('e')
                .num_args(2..=3)
                .value_names(["SourceFile", "DestFile", "KeyFile"]),
        )
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let app_name = PathBuf::from(&args[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "gmpack".to_string());

    let matches = match build_cli().try_get_matches_from(&args) {
        Ok(matches) => matches,
        Err(_) => {
            print_usage(&app_name);
            return;
        }
    };

    if let Some(values) = matches.get_many::<String>("build") {
        let values: Vec<String> = values.cloned().collect();
        build_package(&values[0], &values[1..]);
    } else if let Some(values) = matches.get_many::<String>("install") {
        let values: Vec<String> = values.cloned().collect();
        install_package(&values[0], &values[1]);
    } else if let Some(values) = matches.get_many::<String>("encrypt") {
        let values: Vec<String> = values.cloned().collect();
        let key_file = values.get(2).map(|s| s.as_str());
        encrypt(&values[0], &values[1], key_file);
    } else {
        print_usage(&app_name);
    }
}
