//! JSON signing plans: the template to build, who signs, and in which order.
//!
//! ```json
//! {
//!   "template": {
//!     "path": "results/template.pdf",
//!     "fields": [{ "name": "sig1", "label": "Signer 1: Alice" }],
//!     "layout": { "field_height": 60 }
//!   },
//!   "identities": {
//!     "alice": { "keystore": "keystores/alice.p12", "password": "secret" }
//!   },
//!   "chains": [{
//!     "name": "chain1",
//!     "steps": [{
//!       "signer": "alice",
//!       "field": "sig1",
//!       "certification": "certified_form_filling",
//!       "dest": "results/chain1/step_1.pdf"
//!     }]
//!   }]
//! }
//! ```
//!
//! Relative paths are resolved against the directory holding the plan.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    CertificationLevel, FormBuilder, FormLayout, Pkcs7Signer, SigningChain, SigningConfig, SigningStep,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub template: TemplateSpec,
    /// Credential stores by identity name.
    #[serde(default)]
    pub identities: BTreeMap<String, IdentitySpec>,
    #[serde(default)]
    pub config: SigningConfig,
    pub chains: Vec<ChainSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub path: PathBuf,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub layout: FormLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySpec {
    /// PKCS #12 file.
    pub keystore: PathBuf,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    /// Input of the first step. Defaults to the template.
    pub source: Option<PathBuf>,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Key into [`Plan::identities`].
    pub signer: String,
    pub field: String,
    #[serde(default)]
    pub certification: CertificationLevel,
    pub dest: PathBuf,
}

impl Plan {
    /// Reads a plan and makes its paths absolute relative to the plan file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {}", path.display()))?;
        let plan: Plan = serde_json::from_str(&text)
            .with_context(|| format!("parsing plan {}", path.display()))?;
        Ok(plan.resolved_against(path.parent().unwrap_or(Path::new(""))))
    }

    /// Joins every relative path of the plan onto `base`.
    pub fn resolved_against(mut self, base: &Path) -> Self {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        resolve(&mut self.template.path);
        for identity in self.identities.values_mut() {
            resolve(&mut identity.keystore);
        }
        for chain in &mut self.chains {
            if let Some(source) = &mut chain.source {
                resolve(source);
            }
            for step in &mut chain.steps {
                resolve(&mut step.dest);
            }
        }
        self
    }

    pub fn form_builder(&self) -> FormBuilder {
        self.template
            .fields
            .iter()
            .fold(FormBuilder::with_layout(self.template.layout.clone()), |builder, field| {
                builder.field(&field.name, &field.label)
            })
    }

    /// Binds the chains of the plan to loaded signers, keyed by identity name.
    pub fn chains<'a, S: Pkcs7Signer + Sync>(
        &self,
        signers: &'a HashMap<String, S>,
    ) -> Result<Vec<SigningChain<'a>>> {
        self.chains
            .iter()
            .map(|chain| {
                let steps = chain
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(idx, step)| {
                        let signer = signers.get(&step.signer).ok_or_else(|| {
                            anyhow!(
                                "step {idx} of chain {:?} uses unknown identity {:?}",
                                chain.name,
                                step.signer
                            )
                        })?;
                        Ok(SigningStep {
                            signer,
                            field_name: step.field.clone(),
                            certification: step.certification,
                            dest: step.dest.clone(),
                        })
                    })
                    .collect::<Result<_>>()?;
                Ok(SigningChain {
                    name: chain.name.clone(),
                    source: chain
                        .source
                        .clone()
                        .unwrap_or_else(|| self.template.path.clone()),
                    steps,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::FakeSigner, FailureKind, Orchestrator};

    const PLAN: &str = r#"{
        "template": {
            "path": "results/template.pdf",
            "fields": [
                { "name": "sig1", "label": "Signer 1: Alice" },
                { "name": "sig2" }
            ]
        },
        "identities": {
            "alice": { "keystore": "keystores/alice.p12", "password": "a" },
            "bob": { "keystore": "/etc/keystores/bob.p12", "password": "b" }
        },
        "config": { "metadata": { "reason": "Approval" } },
        "chains": [
            {
                "name": "chain1",
                "steps": [
                    {
                        "signer": "alice",
                        "field": "sig1",
                        "certification": "certified_form_filling",
                        "dest": "results/chain1/step_1.pdf"
                    },
                    { "signer": "bob", "field": "sig2", "dest": "results/chain1/step_2.pdf" }
                ]
            },
            {
                "name": "continued",
                "source": "/tmp/other.pdf",
                "steps": [{ "signer": "carol", "field": "sig2", "dest": "out.pdf" }]
            }
        ]
    }"#;

    fn plan() -> Plan {
        serde_json::from_str::<Plan>(PLAN)
            .unwrap()
            .resolved_against(Path::new("/work"))
    }

    #[test]
    fn paths_are_resolved_against_the_plan() {
        let plan = plan();
        assert_eq!(plan.template.path, Path::new("/work/results/template.pdf"));
        assert_eq!(
            plan.identities["alice"].keystore,
            Path::new("/work/keystores/alice.p12")
        );
        assert_eq!(
            plan.identities["bob"].keystore,
            Path::new("/etc/keystores/bob.p12")
        );
        assert_eq!(
            plan.chains[0].steps[1].dest,
            Path::new("/work/results/chain1/step_2.pdf")
        );
        assert_eq!(plan.chains[1].source.as_deref(), Some(Path::new("/tmp/other.pdf")));

        assert_eq!(plan.config.metadata.reason.as_deref(), Some("Approval"));
        assert!(plan.config.verify_each_step);
        assert_eq!(
            plan.chains[0].steps[1].certification,
            CertificationLevel::NotCertified
        );
    }

    #[test]
    fn chains_bind_to_loaded_signers() {
        let plan = plan();
        let mut signers = HashMap::new();
        signers.insert("alice".to_owned(), FakeSigner("Alice"));
        signers.insert("bob".to_owned(), FakeSigner("Bob"));

        let err = plan.chains(&signers).err().unwrap();
        assert!(err.to_string().contains("\"carol\""), "{err}");

        signers.insert("carol".to_owned(), FakeSigner("Carol"));
        let chains = plan.chains(&signers).unwrap();
        assert_eq!(chains[0].source, plan.template.path);
        assert_eq!(chains[0].steps[0].signer.signer_name(), "Alice");
        assert_eq!(
            chains[0].steps[0].certification,
            CertificationLevel::CertifiedFormFilling
        );
        assert_eq!(chains[1].source, Path::new("/tmp/other.pdf"));
    }

    #[test]
    fn demo_plan_certifies_its_last_chain_twice() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
        let plan = Plan::from_file(dir.join("sequential_signatures.json")).unwrap();
        assert_eq!(plan.template.path, dir.join("results/multiple_signatures.pdf"));
        assert_eq!(plan.chains.len(), 4);

        let certifications = |chain: &ChainSpec| {
            chain
                .steps
                .iter()
                .filter(|s| s.certification.is_certification())
                .count()
        };
        let counts: Vec<usize> = plan.chains.iter().map(certifications).collect();
        assert_eq!(counts, [1, 1, 1, 2]);
    }

    #[test]
    fn demo_plan_runs_end_to_end() {
        let demo = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/sequential_signatures.json");
        let dir = tempfile::tempdir().unwrap();
        let plan = serde_json::from_str::<Plan>(&std::fs::read_to_string(demo).unwrap())
            .unwrap()
            .resolved_against(dir.path());
        plan.form_builder().save(&plan.template.path).unwrap();

        let signers: HashMap<String, FakeSigner> = [
            ("alice", FakeSigner("Alice")),
            ("bob", FakeSigner("Bob")),
            ("carol", FakeSigner("Carol")),
        ]
        .into_iter()
        .map(|(name, signer)| (name.to_owned(), signer))
        .collect();
        let chains = plan.chains(&signers).unwrap();
        let results = Orchestrator::new(plan.config.clone()).run_all(&chains);
        assert_eq!(results.len(), 4);

        for (result, chain) in results[..3].iter().zip(&plan.chains) {
            let produced = result.as_ref().unwrap();
            assert_eq!(produced.len(), 3, "chain {}", chain.name);
            let last = crate::inspect(&std::fs::read(&produced[2]).unwrap()).unwrap();
            assert!(last.is_fully_signed());
            assert_eq!(last.signatures.len(), 3);
        }

        let err = results[3].as_ref().unwrap_err();
        assert_eq!(err.chain, "certified_twice");
        assert_eq!(err.step, 2);
        assert_eq!(err.signer, "Carol");
        assert_eq!(err.kind, FailureKind::PolicyViolation);
        assert!(matches!(
            err.cause.downcast_ref::<crate::Error>(),
            Some(crate::Error::AlreadyCertified)
        ));
        assert!(plan.chains[3].steps[1].dest.exists());
        assert!(!plan.chains[3].steps[2].dest.exists());
    }

    #[test]
    fn form_builder_follows_the_template() {
        let plan = plan();
        assert_eq!(plan.template.layout, FormLayout::default());
        let names: Vec<String> = plan.form_builder().field_names().map(String::from).collect();
        assert_eq!(names, ["sig1", "sig2"]);

        let mut plan: Plan = serde_json::from_str(PLAN).unwrap();
        plan.template.layout = serde_json::from_str(r#"{ "field_height": 80, "margin": 72 }"#)
            .unwrap();
        assert_eq!(plan.template.layout.page_height, 842.0);
        let cells = plan.form_builder().layout_placeholders();
        assert_eq!(cells[0].label_cell.ury, 842.0 - 72.0);
        assert_eq!(cells[0].field_cell.height(), 80.0);
        assert_eq!(cells[0].field_cell.llx, 72.0);
    }
}
