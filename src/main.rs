use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use openssl::stack::Stack;
use pdf_chain_sign::{
    compare::compare,
    inspect,
    openssl::{load_ca_bundle_from_dir, signer_common_names, OpenSslVerifier, SignerIdentity},
    plan::Plan,
    sign, verify_append, verify_signatures, CertificationLevel, FormBuilder, Orchestrator,
    SignRequest, SigningConfig,
};

/// Build signature forms and sign them in sequence, one signer at a time.
#[derive(Parser, Debug)]
#[command(name = "pdf_chain_sign", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a template with one empty signature field per signer
    CreateForm {
        /// Output PDF
        #[arg(long)]
        out: PathBuf,
        /// Field as NAME or NAME=LABEL, in the order they appear
        #[arg(long = "field", required = true)]
        fields: Vec<String>,
    },
    /// Sign one field, appending the signature to a copy of the input
    Sign {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// PKCS #12 credential store
        #[arg(long)]
        keystore: PathBuf,
        #[arg(long)]
        password: String,
        /// Fully qualified name of the signature field
        #[arg(long)]
        field: String,
        #[arg(long, value_enum, default_value_t = CertificationLevel::NotCertified)]
        certification: CertificationLevel,
        /// JSON signing configuration
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        location: Option<String>,
        /// Add an invisible field when FIELD does not exist
        #[arg(long, default_value_t = false)]
        create_missing_field: bool,
    },
    /// Build the template of a JSON plan and run all of its chains
    Run {
        plan: PathBuf,
        /// Reuse an existing template instead of rebuilding it
        #[arg(long, default_value_t = false)]
        keep_template: bool,
    },
    /// List the signatures and signature fields of a document
    Inspect { pdf: PathBuf },
    /// Compare two signed documents, ignoring signing times and signature bytes
    Compare { expected: PathBuf, actual: PathBuf },
    /// Verify every signature against trusted CA certificates
    Verify {
        pdf: PathBuf,
        /// Directory of trusted PEM certificates
        #[arg(long)]
        ca_dir: PathBuf,
        /// Earlier version the document must be a single signature append of
        #[arg(long)]
        previous: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    match Args::parse().command {
        Command::CreateForm { out, fields } => {
            let builder = fields.iter().fold(FormBuilder::new(), |builder, field| {
                let (name, label) = field.split_once('=').unwrap_or((field.as_str(), ""));
                builder.field(name, label)
            });
            builder.save(&out)?;
            println!("{}", out.display());
        }
        Command::Sign {
            input,
            output,
            keystore,
            password,
            field,
            certification,
            config,
            reason,
            location,
            create_missing_field,
        } => {
            let mut config = match config {
                Some(path) => SigningConfig::from_json_file(path)?,
                None => SigningConfig::default(),
            };
            config.metadata.reason = reason.or(config.metadata.reason);
            config.metadata.location = location.or(config.metadata.location);
            config.create_missing_fields |= create_missing_field;

            let identity = SignerIdentity::from_pkcs12_file(&keystore, &password)?;
            let source = std::fs::read(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let signed = sign(
                &source,
                &SignRequest::new(&field, certification, &config),
                &identity,
            )?;
            if config.verify_each_step {
                verify_append(&source, &signed)?;
            }
            if let Some(dir) = output.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&output, signed)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("{}", output.display());
        }
        Command::Run {
            plan,
            keep_template,
        } => {
            let plan = Plan::from_file(&plan)?;
            if !(keep_template && plan.template.path.exists()) {
                plan.form_builder().save(&plan.template.path)?;
            }

            // Credential errors are fatal before any signing happens.
            let signers = plan
                .identities
                .iter()
                .map(|(name, spec)| {
                    let identity =
                        SignerIdentity::from_pkcs12_file(&spec.keystore, &spec.password)
                            .with_context(|| format!("loading identity {name:?}"))?;
                    Ok((name.clone(), identity))
                })
                .collect::<Result<HashMap<_, _>>>()?;
            let chains = plan.chains(&signers)?;

            let orchestrator = Orchestrator::new(plan.config.clone());
            let mut failed = 0;
            for (chain, result) in chains.iter().zip(orchestrator.run_all(&chains)) {
                match result {
                    Ok(files) => {
                        println!("{}: {} file(s)", chain.name, files.len());
                        for file in files {
                            println!("  {}", file.display());
                        }
                    }
                    Err(err) => {
                        failed += 1;
                        eprintln!("{err}");
                    }
                }
            }
            if failed > 0 {
                std::process::exit(1);
            }
        }
        Command::Inspect { pdf } => {
            let bytes =
                std::fs::read(&pdf).with_context(|| format!("reading {}", pdf.display()))?;
            let doc = inspect(&bytes)?;
            println!("pages: {}", doc.page_count);
            println!("certification: {:?}", doc.certification_level);
            for sig in &doc.signatures {
                println!(
                    "signature {:?} by {} at {}{}",
                    sig.field_name,
                    sig.signer_name.as_deref().unwrap_or("?"),
                    sig.signing_time.as_deref().unwrap_or("?"),
                    if sig.certification.is_certification() {
                        format!(" ({:?})", sig.certification)
                    } else {
                        String::new()
                    }
                );
                if let Some(reason) = &sig.reason {
                    println!("  reason: {reason}");
                }
                if let Some(location) = &sig.location {
                    println!("  location: {location}");
                }
                match &sig.annotation {
                    Some(annot) => println!("  page {} at {:?}", annot.page_idx, annot.rect),
                    None => println!("  invisible"),
                }
            }
            for field in &doc.unsigned_fields {
                println!("unsigned field {field:?}");
            }
            println!(
                "last signature covers the whole file: {}",
                doc.is_fully_signed()
            );
        }
        Command::Compare { expected, actual } => {
            let differences = compare(&std::fs::read(&expected)?, &std::fs::read(&actual)?)?;
            for difference in &differences {
                println!("{difference}");
            }
            if !differences.is_empty() {
                std::process::exit(1);
            }
        }
        Command::Verify {
            pdf,
            ca_dir,
            previous,
        } => {
            let bytes =
                std::fs::read(&pdf).with_context(|| format!("reading {}", pdf.display()))?;
            if let Some(previous) = previous {
                let sig = verify_append(&std::fs::read(&previous)?, &bytes)?;
                println!("appends signature {:?} to {}", sig.field_name, previous.display());
            }

            // Stop verification at the first trusted certificate
            let mut builder = load_ca_bundle_from_dir(&ca_dir)?;
            builder.set_flags(openssl::x509::verify::X509VerifyFlags::PARTIAL_CHAIN)?;
            let verifier = OpenSslVerifier::new(builder.build(), Stack::new()?);

            for (sig, pkcs7) in verify_signatures(&bytes, &verifier)? {
                println!(
                    "{:?}: valid, signed by {}",
                    sig.field_name,
                    signer_common_names(&pkcs7)?.join(", ")
                );
            }
        }
    }

    Ok(())
}
