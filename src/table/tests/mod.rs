mod tests_constraints;
mod tests_crud;
mod tests_schema;
