use crate::error::{InitError, LabelerError};
use crate::label::{
    build_canonical_unsigned, encode_for_signing, now_timestamp, LabelData, SignedLabel,
    UnsignedLabel, LABEL_VERSION,
};
use crate::signer::{Secp256k1Signer, Signer};
use crate::store::{FindOptions, LabelFilter, LabelStore, SortOrder, StoreError, StoredLabel};
use crate::subscription::{labels_frames, SubscriptionFrame};
use crate::validation::{
    validate_cid, validate_did, validate_timestamp, validate_uri, validate_val, TimestampRule,
    ValidationError,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Ready = Shared<BoxFuture<'static, Result<Arc<dyn Signer>, Arc<InitError>>>>;

/// Non-fatal findings about a label that was created anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelWarning {
    /// An `at://` subject was labeled without pinning a record version.
    MissingCid { uri: String },
}

impl LabelWarning {
    pub fn message(&self) -> String {
        match self {
            Self::MissingCid { uri } => {
                format!("no CID provided for {uri}; the label applies to every version of the record")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedLabel {
    pub id: i64,
    pub label: SignedLabel,
    pub warnings: Vec<LabelWarning>,
}

/// Label lifecycle orchestrator: validates, signs, persists, negates and
/// pages labels issued under one service DID.
///
/// Signer import and store connection run lazily on first use and are shared
/// by every operation. If setup fails, the failure is kept and every
/// operation on this instance returns [`LabelerError::Initialization`].
pub struct LabelerServer {
    did: String,
    store: Arc<dyn LabelStore>,
    ready: Ready,
}

impl LabelerServer {
    /// Creates a server that signs with the hex-encoded secp256k1 key
    /// `signing_key`.
    pub fn new(
        did: impl Into<String>,
        signing_key: impl Into<String>,
        store: Arc<dyn LabelStore>,
    ) -> Self {
        let did = did.into();
        let signing_key = signing_key.into();
        let setup_did = did.clone();
        let setup_store = store.clone();
        let ready = async move {
            validate_did(&setup_did).map_err(InitError::Did)?;
            let signer = Secp256k1Signer::import(&signing_key)
                .await
                .map_err(InitError::Signer)?;
            setup_store.connect().await.map_err(InitError::Store)?;
            Ok::<Arc<dyn Signer>, InitError>(Arc::new(signer))
        }
        .map(|res| res.map_err(Arc::new))
        .boxed()
        .shared();
        Self { did, store, ready }
    }

    /// Creates a server around an already constructed signer.
    pub fn with_signer(
        did: impl Into<String>,
        signer: Arc<dyn Signer>,
        store: Arc<dyn LabelStore>,
    ) -> Self {
        let did = did.into();
        let setup_did = did.clone();
        let setup_store = store.clone();
        let ready = async move {
            validate_did(&setup_did).map_err(InitError::Did)?;
            setup_store.connect().await.map_err(InitError::Store)?;
            Ok::<Arc<dyn Signer>, InitError>(signer)
        }
        .map(|res| res.map_err(Arc::new))
        .boxed()
        .shared();
        Self { did, store, ready }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Waits for signer and store setup to finish.
    pub async fn ready(&self) -> Result<(), LabelerError> {
        self.signer().await.map(|_| ())
    }

    async fn signer(&self) -> Result<Arc<dyn Signer>, LabelerError> {
        self.ready.clone().await.map_err(LabelerError::Initialization)
    }

    async fn sign(
        &self,
        unsigned: UnsignedLabel,
        context: &'static str,
    ) -> Result<SignedLabel, LabelerError> {
        let signer = self.signer().await?;
        let bytes = encode_for_signing(&unsigned)
            .map_err(|e| LabelerError::signing(context, anyhow::Error::new(e)))?;
        let sig = signer
            .sign(&bytes)
            .await
            .map_err(|e| LabelerError::signing(context, e))?;
        Ok(unsigned.into_signed(sig))
    }

    /// Validates, signs and stores a new label. Labels with an `exp` at or
    /// before now are rejected unless `allow_expired` is set.
    pub async fn create_label(
        &self,
        data: LabelData,
        allow_expired: bool,
    ) -> Result<SignedLabel, LabelerError> {
        self.create_label_with_warnings(data, allow_expired)
            .await
            .map(|created| created.label)
    }

    /// Same as [`Self::create_label`], also returning the assigned identity
    /// and any soft warnings.
    pub async fn create_label_with_warnings(
        &self,
        mut data: LabelData,
        allow_expired: bool,
    ) -> Result<CreatedLabel, LabelerError> {
        self.signer().await?;
        let warnings = validate_label_data(&data, allow_expired)?;
        for warning in &warnings {
            warn!("{}", warning.message());
        }

        let cts = match data.cts.take() {
            Some(cts) => cts,
            None => {
                let cts = now_timestamp();
                validate_timestamp(&cts, "cts", TimestampRule::NotInFuture)?;
                cts
            }
        };
        data.cts = Some(cts);

        let unsigned = build_canonical_unsigned(data, &self.did);
        let label = self.sign(unsigned, "failed to create label").await?;
        let stored = self
            .store
            .insert(label)
            .await
            .map_err(|e| LabelerError::persistence("failed to create label", e))?;
        info!(
            "Created label {}: {} on {}",
            stored.id, stored.label.val, stored.label.uri
        );

        Ok(CreatedLabel {
            id: stored.id,
            label: stored.label,
            warnings,
        })
    }

    /// Active labels matching `filter`, oldest first.
    pub async fn query_labels(&self, filter: LabelFilter) -> Result<Vec<SignedLabel>, LabelerError> {
        Ok(self
            .query_labels_with(filter, FindOptions::default())
            .await?
            .into_iter()
            .map(|stored| stored.label)
            .collect())
    }

    /// Labels matching `filter` with explicit ordering and paging, keeping
    /// their identities.
    pub async fn query_labels_with(
        &self,
        filter: LabelFilter,
        options: FindOptions,
    ) -> Result<Vec<StoredLabel>, LabelerError> {
        self.signer().await?;
        if let Some(exp) = &filter.exp {
            validate_timestamp(
                exp,
                "exp",
                TimestampRule::InFuture {
                    allow_expired: filter.allow_expired,
                },
            )?;
        }
        let labels = self
            .store
            .find_many(&filter, options)
            .await
            .map_err(|e| LabelerError::persistence("failed to query labels", e))?;
        debug!("Label query matched {} labels", labels.len());
        Ok(labels)
    }

    /// Point lookup. Expired labels are still returned.
    pub async fn query_label(&self, id: i64) -> Result<Option<SignedLabel>, LabelerError> {
        self.signer().await?;
        let stored = self
            .store
            .find_one(id)
            .await
            .map_err(|e| LabelerError::persistence("failed to query label", e))?;
        Ok(stored.map(|stored| stored.label))
    }

    /// Negates label `id` by appending a new signed record with `neg: true`
    /// and a fresh `cts`. The original record is left untouched.
    pub async fn delete_label(&self, id: i64) -> Result<Option<SignedLabel>, LabelerError> {
        self.signer().await?;
        let Some(existing) = self
            .store
            .find_one(id)
            .await
            .map_err(|e| LabelerError::persistence("failed to delete label", e))?
        else {
            debug!("Label {id} not found, nothing to negate");
            return Ok(None);
        };

        let unsigned = UnsignedLabel {
            neg: true,
            cts: now_timestamp(),
            ver: LABEL_VERSION,
            ..existing.label.unsigned()
        };
        let negation = self.sign(unsigned, "failed to sign negated label").await?;
        let stored = self
            .store
            .insert(negation)
            .await
            .map_err(|e| LabelerError::persistence("failed to save negated label to database", e))?;
        info!(
            "Negated label {id} as {}: {} on {}",
            stored.id, stored.label.val, stored.label.uri
        );
        Ok(Some(stored.label))
    }

    /// Re-signs label `id` with `neg` flipped and a fresh `cts`. With `save`
    /// the record at `id` is overwritten in place; without it the store is
    /// not touched.
    pub async fn reverse_label_negation(
        &self,
        id: i64,
        save: bool,
    ) -> Result<Option<SignedLabel>, LabelerError> {
        self.signer().await?;
        let Some(existing) = self
            .store
            .find_one(id)
            .await
            .map_err(|e| LabelerError::persistence("failed to reverse label negation", e))?
        else {
            debug!("Label {id} not found, nothing to reverse");
            return Ok(None);
        };

        let unsigned = UnsignedLabel {
            neg: !existing.label.neg,
            cts: now_timestamp(),
            ver: LABEL_VERSION,
            ..existing.label.unsigned()
        };
        let reversed = self.sign(unsigned, "failed to sign reversed label").await?;
        if !save {
            return Ok(Some(reversed));
        }

        let updated = self
            .store
            .update_by_id(id, &reversed)
            .await
            .map_err(|e| {
                LabelerError::persistence("failed to save reversed label to database", e)
            })?;
        if !updated {
            warn!("Label {id} disappeared before its reversal could be saved");
            return Ok(None);
        }
        info!("Reversed negation of label {id}, neg is now {}", reversed.neg);
        Ok(Some(reversed))
    }

    /// Up to `limit` labels with identity strictly greater than `cursor`, in
    /// ascending identity order.
    pub async fn get_labels_after_cursor(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<StoredLabel>, LabelerError> {
        self.signer().await?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let labels = self
            .store
            .find_after(cursor, limit)
            .await
            .map_err(|e| LabelerError::persistence("failed to fetch labels after cursor", e))?;

        let mut last = cursor;
        for stored in &labels {
            if stored.id <= last {
                return Err(LabelerError::persistence(
                    "failed to fetch labels after cursor",
                    StoreError::InvalidState(format!(
                        "store returned label {} after {last}",
                        stored.id
                    )),
                ));
            }
            last = stored.id;
        }
        if labels.len() > limit {
            return Err(LabelerError::persistence(
                "failed to fetch labels after cursor",
                StoreError::InvalidState(format!(
                    "store returned {} labels for a limit of {limit}",
                    labels.len()
                )),
            ));
        }
        Ok(labels)
    }

    /// Highest identity assigned so far, 0 for an empty store.
    pub async fn latest_id(&self) -> Result<i64, LabelerError> {
        let newest = self
            .query_labels_with(
                LabelFilter {
                    allow_expired: true,
                    ..Default::default()
                },
                FindOptions {
                    sort: SortOrder::Descending,
                    skip: 0,
                    limit: Some(1),
                },
            )
            .await?;
        Ok(newest.first().map(|stored| stored.id).unwrap_or(0))
    }

    /// Catch-up frames for a `subscribeLabels` consumer resuming after
    /// `cursor`. A cursor beyond the newest identity yields a single
    /// `FutureCursor` error frame.
    pub async fn subscription_frames(
        &self,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SubscriptionFrame>, LabelerError> {
        let cursor = cursor.unwrap_or(0);
        if cursor > self.latest_id().await? {
            return Ok(vec![SubscriptionFrame::future_cursor()]);
        }
        let labels = self.get_labels_after_cursor(cursor, limit).await?;
        Ok(labels_frames(labels))
    }

    /// [`Self::subscription_frames`] encoded for the wire.
    pub async fn subscription_frame_bytes(
        &self,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, LabelerError> {
        let frames = self.subscription_frames(cursor, limit).await?;
        let mut encoded = Vec::with_capacity(frames.len());
        for frame in &frames {
            encoded.push(frame.to_bytes()?);
        }
        Ok(encoded)
    }

    pub async fn close(&self) -> Result<(), LabelerError> {
        self.store
            .close()
            .await
            .map_err(|e| LabelerError::persistence("failed to close label store", e))
    }
}

/// Field and cross-field checks for a new label. Runs before anything is
/// signed or stored.
pub fn validate_label_data(
    data: &LabelData,
    allow_expired: bool,
) -> Result<Vec<LabelWarning>, ValidationError> {
    let mut warnings = Vec::new();

    if let Some(ver) = data.ver {
        if ver != LABEL_VERSION {
            return Err(ValidationError::new(format!(
                "unsupported label version {ver}, expected {LABEL_VERSION}"
            )));
        }
    }
    validate_val(&data.val)?;
    validate_uri(&data.uri)?;

    if data.uri.starts_with("did:") {
        if data.cid.is_some() {
            return Err(ValidationError::new("CID cannot be provided for DID URIs"));
        }
    } else {
        match &data.cid {
            Some(cid) => validate_cid(cid)?,
            None => warnings.push(LabelWarning::MissingCid {
                uri: data.uri.clone(),
            }),
        }
    }

    if let Some(src) = &data.src {
        validate_did(src)?;
    }
    if let Some(cts) = &data.cts {
        validate_timestamp(cts, "cts", TimestampRule::NotInFuture)?;
    }
    if let Some(exp) = &data.exp {
        validate_timestamp(exp, "exp", TimestampRule::InFuture { allow_expired })?;
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(uri: &str) -> LabelData {
        LabelData {
            val: "spam".to_string(),
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_version_must_be_one() {
        let err = validate_label_data(
            &LabelData {
                ver: Some(2),
                ..data("did:plc:7iza6de2dwap2sbkpav7c6c6")
            },
            false,
        )
        .unwrap_err();
        assert!(err.reason().contains("version"));
        validate_label_data(
            &LabelData {
                ver: Some(1),
                ..data("did:plc:7iza6de2dwap2sbkpav7c6c6")
            },
            false,
        )
        .unwrap();
    }

    #[test]
    fn test_cid_rules() {
        let cid = "bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm".to_string();
        let err = validate_label_data(
            &LabelData {
                cid: Some(cid.clone()),
                ..data("did:plc:7iza6de2dwap2sbkpav7c6c6")
            },
            false,
        )
        .unwrap_err();
        assert_eq!(err.reason(), "CID cannot be provided for DID URIs");

        let post = "at://did:web:example.com/app.bsky.feed.post/abc";
        assert_eq!(
            validate_label_data(&data(post), false).unwrap(),
            vec![LabelWarning::MissingCid {
                uri: post.to_string()
            }]
        );
        assert!(validate_label_data(
            &LabelData {
                cid: Some(cid),
                ..data(post)
            },
            false
        )
        .unwrap()
        .is_empty());
        assert!(validate_label_data(
            &LabelData {
                cid: Some("bnotacid".to_string()),
                ..data(post)
            },
            false
        )
        .is_err());
    }

    #[test]
    fn test_src_and_timestamps() {
        let subject = "did:plc:7iza6de2dwap2sbkpav7c6c6";
        assert!(validate_label_data(
            &LabelData {
                src: Some("not-a-did".to_string()),
                ..data(subject)
            },
            false
        )
        .is_err());
        assert!(validate_label_data(
            &LabelData {
                cts: Some("2999-01-01T00:00:00Z".to_string()),
                ..data(subject)
            },
            false
        )
        .is_err());

        let expired = LabelData {
            exp: Some("2020-01-01T00:00:00Z".to_string()),
            ..data(subject)
        };
        assert!(validate_label_data(&expired, false).is_err());
        validate_label_data(&expired, true).unwrap();
    }

    #[test]
    fn test_rejects_bad_subject_and_value() {
        assert!(validate_label_data(&data("https://example.com"), false).is_err());
        assert!(validate_label_data(
            &LabelData {
                val: "not valid".to_string(),
                ..data("did:plc:7iza6de2dwap2sbkpav7c6c6")
            },
            false
        )
        .is_err());
    }
}
