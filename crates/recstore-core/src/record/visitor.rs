//! Innermost visitor: logical changes into record changes

use crate::record::{IntegrityValidator, TransactionRecordState};
use crate::storage::explicit_index::ExplicitIndexCommand;
use crate::storage::schema::SchemaRule;
use crate::storage::token::TokenKind;
use crate::txstate::{LabelDiff, PropertyDiff, RelationshipData, TxStateVisitor};
use crate::Result;

/// Applies every visited change to a [`TransactionRecordState`]
pub struct TransactionToRecordStateVisitor<'a, 's> {
    records: &'a mut TransactionRecordState<'s>,
    validator: IntegrityValidator<'a>,
}

impl<'a, 's> TransactionToRecordStateVisitor<'a, 's> {
    /// Visitor writing into `records`
    pub fn new(records: &'a mut TransactionRecordState<'s>, validator: IntegrityValidator<'a>) -> Self {
        Self { records, validator }
    }
}

impl TxStateVisitor for TransactionToRecordStateVisitor<'_, '_> {
    fn visit_created_token(&mut self, kind: TokenKind, id: u32, name: &str) -> Result<()> {
        self.records.create_token(kind, id, name);
        Ok(())
    }

    fn visit_created_node(&mut self, id: u64) -> Result<()> {
        self.records.node_create(id);
        Ok(())
    }

    fn visit_deleted_node(&mut self, id: u64) -> Result<()> {
        self.records.node_delete(id)
    }

    fn visit_created_relationship(&mut self, id: u64, data: RelationshipData) -> Result<()> {
        self.records
            .relationship_create(id, data.type_id, data.start_node, data.end_node)
    }

    fn visit_deleted_relationship(&mut self, id: u64, _data: RelationshipData) -> Result<()> {
        self.records.relationship_delete(id)
    }

    fn visit_node_label_changes(&mut self, id: u64, diff: &LabelDiff) -> Result<()> {
        for label in &diff.removed {
            self.records.remove_label(id, *label)?;
        }
        for label in &diff.added {
            self.records.add_label(id, *label)?;
        }
        Ok(())
    }

    fn visit_node_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()> {
        for key in &diff.removed {
            self.records.node_remove_property(id, *key)?;
        }
        for (key, value) in &diff.changed {
            self.records.node_set_property(id, *key, value.clone())?;
        }
        Ok(())
    }

    fn visit_relationship_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()> {
        for key in &diff.removed {
            self.records.relationship_remove_property(id, *key)?;
        }
        for (key, value) in &diff.changed {
            self.records
                .relationship_set_property(id, *key, value.clone())?;
        }
        Ok(())
    }

    fn visit_added_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        self.validator.validate_schema_rule(rule)?;
        self.records.create_schema_rule(rule.clone());
        Ok(())
    }

    fn visit_removed_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        self.records.drop_schema_rule(rule.clone());
        Ok(())
    }

    fn visit_explicit_index(&mut self, command: &ExplicitIndexCommand) -> Result<()> {
        self.records.explicit_index(command.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
